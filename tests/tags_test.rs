// Tag resolution and dispatch tests

mod common;

use common::{capture_logger, field};
use reqlog::host::LogEvent;
use reqlog::tags::{TagLevelMap, TagResolver, dispatch, parse_fallback, resolve_level};
use reqlog::{ConfigError, Level};
use serde_json::json;

fn map(overrides: &[(&str, &str)]) -> TagLevelMap {
    TagLevelMap::with_overrides(overrides.iter().copied()).unwrap()
}

#[test]
fn test_first_mapped_tag_wins() {
    let map = map(&[("aaa", "info"), ("bbb", "warn")]);

    assert_eq!(resolve_level(&map, None, &["aaa", "bbb"]), Some(Level::Info));
}

#[test]
fn test_later_higher_severity_is_not_consulted() {
    let map = map(&[("audit", "debug")]);

    assert_eq!(
        resolve_level(&map, Some(Level::Info), &["audit", "error", "warn"]),
        Some(Level::Debug)
    );
}

#[test]
fn test_unmapped_tags_are_skipped() {
    let map = map(&[("db", "warn")]);

    assert_eq!(
        resolve_level(&map, Some(Level::Info), &["request", "handler", "db", "error"]),
        Some(Level::Warn)
    );
}

#[test]
fn test_defaults_only_falls_back() {
    let map = map(&[]);

    assert_eq!(
        resolve_level(&map, Some(Level::Info), &["something"]),
        Some(Level::Info)
    );
}

#[test]
fn test_absent_fallback_suppresses() {
    let map = map(&[]);

    assert_eq!(resolve_level(&map, None, &["unmatched"]), None);
}

#[test]
fn test_default_level_names_are_tags() {
    let map = map(&[]);

    assert_eq!(resolve_level(&map, None, &["error"]), Some(Level::Error));
    assert_eq!(resolve_level(&map, None, &["x", "trace"]), Some(Level::Trace));
}

#[test]
fn test_invalid_override_is_config_error() {
    let result = TagLevelMap::with_overrides([("aaa", "info"), ("bbb", "fatal")]);

    assert!(matches!(result, Err(ConfigError::InvalidTagLevel { ref tag, .. }) if tag == "bbb"));
}

#[test]
fn test_invalid_fallback_is_config_error() {
    assert_eq!(
        parse_fallback("critical"),
        Err(ConfigError::InvalidFallback("critical".to_string()))
    );
    assert_eq!(parse_fallback("none"), Ok(None));
    assert_eq!(parse_fallback("warn"), Ok(Some(Level::Warn)));
}

#[test]
fn test_dispatch_writes_tags_and_data() {
    let (sink, logger) = capture_logger();

    dispatch(&logger, Some(Level::Warn), &["db", "slow"], json!({"ms": 1200}));

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].level, Level::Warn);
    assert_eq!(field(&records[0], "tags"), &json!(["db", "slow"]));
    assert_eq!(field(&records[0], "data"), &json!({"ms": 1200}));
}

#[test]
fn test_dispatch_none_writes_nothing() {
    let (sink, logger) = capture_logger();

    dispatch(&logger, None, &["unmatched"], json!("payload"));

    assert_eq!(sink.len(), 0);
}

#[test]
fn test_resolver_log_event_uses_first_match() {
    let (sink, logger) = capture_logger();
    let resolver = TagResolver::new(map(&[("aaa", "info"), ("bbb", "warn")]), None);

    let level = resolver.log_event(&logger, &LogEvent::new(&["aaa", "bbb"], Some(json!(1))));

    assert_eq!(level, Some(Level::Info));
    assert_eq!(sink.records()[0].level, Level::Info);
}

#[test]
fn test_resolver_ignore_tags() {
    let (sink, logger) = capture_logger();
    let resolver = TagResolver::new(map(&[]), Some(Level::Info))
        .ignore_tags(vec!["healthcheck".to_string()]);

    let level = resolver.log_event(
        &logger,
        &LogEvent::new(&["error", "healthcheck"], Some(json!("ping"))),
    );

    assert_eq!(level, None);
    assert_eq!(sink.len(), 0);
}

#[test]
fn test_resolver_merge_data_object() {
    let (sink, logger) = capture_logger();
    let resolver = TagResolver::new(map(&[]), Some(Level::Info)).merge_data(true);

    resolver.log_event(
        &logger,
        &LogEvent::new(&["user"], Some(json!({"userId": 7, "action": "login"}))),
    );

    let record = &sink.records()[0];
    assert_eq!(field(record, "userId"), &json!(7));
    assert_eq!(field(record, "action"), &json!("login"));
    assert_eq!(field(record, "tags"), &json!(["user"]));
    assert!(!record.fields.contains_key("data"));
}

#[test]
fn test_resolver_merge_data_string_becomes_message() {
    let (sink, logger) = capture_logger();
    let resolver = TagResolver::new(map(&[]), Some(Level::Info)).merge_data(true);

    resolver.log_event(&logger, &LogEvent::new(&["note"], Some(json!("cache warmed"))));

    assert_eq!(sink.records()[0].msg.as_deref(), Some("cache warmed"));
}

#[test]
fn test_resolver_error_event_logs_err() {
    let (sink, logger) = capture_logger();
    let resolver = TagResolver::new(map(&[]), Some(Level::Info));
    let err = std::io::Error::other("connection reset");

    resolver.log_event(&logger, &LogEvent::from_error(&["error", "upstream"], &err));

    let record = &sink.records()[0];
    assert_eq!(record.level, Level::Error);
    assert_eq!(field(record, "err")["message"], json!("connection reset"));
    assert!(!record.fields.contains_key("data"));
}
