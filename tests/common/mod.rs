// Shared helpers for integration tests
#![allow(dead_code)]

use reqlog::Logger;
use reqlog::logger::{Record, Sink};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Keeps every record in memory.
#[derive(Default)]
pub struct CaptureSink {
    records: Mutex<Vec<Record>>,
}

impl CaptureSink {
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn with_msg(&self, msg: &str) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|r| r.msg.as_deref() == Some(msg))
            .collect()
    }

    pub fn tagged(&self) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|r| r.fields.contains_key("tags"))
            .collect()
    }
}

impl Sink for CaptureSink {
    fn write(&self, record: &Record) {
        self.records.lock().unwrap().push(record.clone());
    }
}

pub fn capture_logger() -> (Arc<CaptureSink>, Logger) {
    let sink = Arc::new(CaptureSink::default());
    let logger = Logger::new(sink.clone());
    (sink, logger)
}

pub fn field<'a>(record: &'a Record, key: &str) -> &'a Value {
    record.fields.get(key).unwrap_or(&Value::Null)
}
