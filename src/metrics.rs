// Prometheus counters for written and suppressed records

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, TextEncoder, register_histogram,
    register_int_counter, register_int_counter_vec,
};

pub static RECORDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "reqlog_records_total",
        "Log records handed to a sink, by level",
        &["level"]
    )
    .expect("reqlog_records_total can be registered")
});

pub static EVENTS_SUPPRESSED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "reqlog_events_suppressed_total",
        "Tagged events dropped by ignore_tags or an absent fallback"
    )
    .expect("reqlog_events_suppressed_total can be registered")
});

pub static RESPONSE_TIME_MS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "reqlog_response_time_milliseconds",
        "Elapsed time between request received and response sent",
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .expect("reqlog_response_time_milliseconds can be registered")
});

/// Text exposition of every registered metric.
pub fn gather() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_counters() {
        RECORDS_TOTAL.with_label_values(&["info"]).inc();
        EVENTS_SUPPRESSED_TOTAL.inc();

        let text = gather().unwrap();
        assert!(text.contains("reqlog_records_total"));
        assert!(text.contains("reqlog_events_suppressed_total"));
    }
}
