// Structured logger handle, record sinks, and tracing subscriber setup

use crate::config::{Destination, LoggerConfig};
use crate::error::ConfigError;
use crate::level::Level;
use crate::metrics;
use crate::serializers::{Fields, Serializers};
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

/// Initialize the process-wide tracing subscriber from the logger configuration.
///
/// Internal diagnostics always go through it; records go through it only
/// when the destination is [`Destination::Tracing`].
pub fn init_subscriber(config: &LoggerConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    if config.pretty {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install subscriber: {}", e))?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_current_span(false)
            .with_span_list(true)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install subscriber: {}", e))?;
    }

    Ok(())
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One emitted log record.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub level: Level,
    pub time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(flatten)]
    pub fields: Fields,
}

/// Destination for finished records. Owns whatever synchronization it needs.
pub trait Sink: Send + Sync {
    fn write(&self, record: &Record);
}

/// JSON lines (or indented JSON when `pretty`) to any writer.
pub struct WriterSink<W> {
    writer: Mutex<W>,
    pretty: bool,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        WriterSink {
            writer: Mutex::new(writer),
            pretty: false,
        }
    }

    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }
}

impl<W: Write + Send> Sink for WriterSink<W> {
    fn write(&self, record: &Record) {
        let encoded = if self.pretty {
            serde_json::to_vec_pretty(record)
        } else {
            serde_json::to_vec(record)
        };
        let mut line = match encoded {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode log record");
                return;
            }
        };
        line.push(b'\n');

        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writer.write_all(&line).and_then(|_| writer.flush()) {
            tracing::warn!(error = %e, "Failed to write log record");
        }
    }
}

/// Forwards records into `tracing` events at the matching level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl Sink for TracingSink {
    fn write(&self, record: &Record) {
        let fields = Value::Object(record.fields.clone());
        let msg = record.msg.as_deref().unwrap_or("");
        match record.level {
            Level::Trace => tracing::trace!(target: "reqlog", fields = %fields, "{}", msg),
            Level::Debug => tracing::debug!(target: "reqlog", fields = %fields, "{}", msg),
            Level::Info => tracing::info!(target: "reqlog", fields = %fields, "{}", msg),
            Level::Warn => tracing::warn!(target: "reqlog", fields = %fields, "{}", msg),
            Level::Error => tracing::error!(target: "reqlog", fields = %fields, "{}", msg),
        }
    }
}

/// Open the sink a destination names.
pub fn build_sink(destination: &Destination, pretty: bool) -> std::io::Result<Arc<dyn Sink>> {
    let sink: Arc<dyn Sink> = match destination {
        Destination::Stdout => Arc::new(WriterSink::new(std::io::stdout()).pretty(pretty)),
        Destination::Stderr => Arc::new(WriterSink::new(std::io::stderr()).pretty(pretty)),
        Destination::Tracing => Arc::new(TracingSink),
        Destination::File(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("log file path has no file name: {:?}", path),
                    )
                })?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(file_name)
                .build(directory)
                .map_err(std::io::Error::other)?;
            Arc::new(WriterSink::new(appender).pretty(pretty))
        }
    };
    Ok(sink)
}

struct LoggerInner {
    sink: Arc<dyn Sink>,
    serializers: Serializers,
    /// Effective table installed once by [`Logger::bind_serializers`].
    bound: OnceLock<Serializers>,
    bindings: Fields,
    level: Level,
}

/// Cheap-clone handle to an immutable logger.
///
/// Clones share the same instance (see [`Logger::ptr_eq`]). [`Logger::child`]
/// and [`Logger::with_serializers`] produce new instances and never touch the
/// parent. The only in-place change is the one-time bind-time serializer
/// table, which every clone observes.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl Logger {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Logger::from_parts(sink, Serializers::new(), Fields::new(), Level::Trace)
    }

    fn from_parts(sink: Arc<dyn Sink>, serializers: Serializers, bindings: Fields, level: Level) -> Self {
        Logger {
            inner: Arc::new(LoggerInner {
                sink,
                serializers,
                bound: OnceLock::new(),
                bindings,
                level,
            }),
        }
    }

    /// Same sink, serializers and bindings, different minimum level.
    pub fn with_level(&self, level: Level) -> Self {
        Logger::from_parts(
            Arc::clone(&self.inner.sink),
            self.serializers().clone(),
            self.inner.bindings.clone(),
            level,
        )
    }

    /// Keeps every serializer this logger already has; `overrides` win on
    /// key collision.
    pub fn with_serializers(&self, overrides: &Serializers) -> Self {
        Logger::from_parts(
            Arc::clone(&self.inner.sink),
            self.serializers().merged(overrides),
            self.inner.bindings.clone(),
            self.inner.level,
        )
    }

    /// Install the table a host binding settles on, in place: `defaults`
    /// first, this logger's own serializers over them, `overrides` last.
    ///
    /// Allowed once per logger instance. A second call leaves the table
    /// untouched and fails.
    pub fn bind_serializers(
        &self,
        defaults: &Serializers,
        overrides: &Serializers,
    ) -> Result<(), ConfigError> {
        let table = defaults.merged(&self.inner.serializers).merged(overrides);
        self.inner
            .bound
            .set(table)
            .map_err(|_| ConfigError::InstanceAlreadyBound)
    }

    /// Derived logger carrying `bindings` on every record, after the parent's
    /// own bindings. Bindings go through the serializer table once, here.
    pub fn child(&self, mut bindings: Fields) -> Self {
        self.serializers().apply(&mut bindings);
        let mut merged = self.inner.bindings.clone();
        merged.extend(bindings);

        Logger::from_parts(
            Arc::clone(&self.inner.sink),
            self.serializers().clone(),
            merged,
            self.inner.level,
        )
    }

    pub fn level(&self) -> Level {
        self.inner.level
    }

    pub fn serializers(&self) -> &Serializers {
        self.inner.bound.get().unwrap_or(&self.inner.serializers)
    }

    pub fn bindings(&self) -> &Fields {
        &self.inner.bindings
    }

    pub fn is_enabled(&self, level: Level) -> bool {
        level >= self.inner.level
    }

    pub fn ptr_eq(&self, other: &Logger) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn log(&self, level: Level, mut fields: Fields, msg: Option<&str>) {
        if !self.is_enabled(level) {
            return;
        }

        self.serializers().apply(&mut fields);
        let mut merged = self.inner.bindings.clone();
        merged.extend(fields);

        let record = Record {
            level,
            time: now_millis(),
            msg: msg.map(str::to_string),
            fields: merged,
        };
        self.inner.sink.write(&record);
        metrics::RECORDS_TOTAL
            .with_label_values(&[level.as_str()])
            .inc();
    }

    pub fn trace(&self, fields: Fields, msg: &str) {
        self.log(Level::Trace, fields, Some(msg));
    }

    pub fn debug(&self, fields: Fields, msg: &str) {
        self.log(Level::Debug, fields, Some(msg));
    }

    pub fn info(&self, fields: Fields, msg: &str) {
        self.log(Level::Info, fields, Some(msg));
    }

    pub fn warn(&self, fields: Fields, msg: &str) {
        self.log(Level::Warn, fields, Some(msg));
    }

    pub fn error(&self, fields: Fields, msg: &str) {
        self.log(Level::Error, fields, Some(msg));
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.inner.level)
            .field("serializers", self.serializers())
            .field("bindings", &self.inner.bindings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct VecSink(Mutex<Vec<Record>>);

    impl Sink for VecSink {
        fn write(&self, record: &Record) {
            self.0.lock().unwrap().push(record.clone());
        }
    }

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_child_does_not_touch_parent() {
        let sink = Arc::new(VecSink::default());
        let parent = Logger::new(sink.clone());
        let child = parent.child(fields(json!({"requestId": "abc"})));

        parent.info(Fields::new(), "from parent");
        child.info(Fields::new(), "from child");

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].fields.get("requestId").is_none());
        assert_eq!(records[1].fields["requestId"], json!("abc"));
        assert!(parent.bindings().is_empty());
        assert!(!parent.ptr_eq(&child));
    }

    #[test]
    fn test_below_minimum_level_is_dropped() {
        let sink = Arc::new(VecSink::default());
        let logger = Logger::new(sink.clone()).with_level(Level::Warn);

        logger.trace(Fields::new(), "dropped");
        logger.debug(Fields::new(), "dropped");
        logger.info(Fields::new(), "dropped");
        logger.warn(Fields::new(), "kept");
        logger.error(Fields::new(), "kept");

        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_trace_and_debug_levels() {
        let sink = Arc::new(VecSink::default());
        let logger = Logger::new(sink.clone());

        logger.trace(Fields::new(), "t");
        logger.debug(Fields::new(), "d");

        let records = sink.0.lock().unwrap();
        assert_eq!(records[0].level, Level::Trace);
        assert_eq!(records[1].level, Level::Debug);
    }

    #[test]
    fn test_bind_serializers_layers_and_keeps_identity() {
        let sink = Arc::new(VecSink::default());
        let logger = Logger::new(sink.clone())
            .with_serializers(&Serializers::new().with("err", |_| json!("own")));
        let handle = logger.clone();

        let defaults = Serializers::new()
            .with("err", |_| json!("default"))
            .with("req", |_| json!("default"));
        let overrides = Serializers::new().with("req", |_| json!("override"));
        logger.bind_serializers(&defaults, &overrides).unwrap();

        handle.info(fields(json!({"err": 1, "req": 2})), "bound");
        let records = sink.0.lock().unwrap();
        assert_eq!(records[0].fields["err"], json!("own"));
        assert_eq!(records[0].fields["req"], json!("override"));
        assert!(handle.ptr_eq(&logger));
    }

    #[test]
    fn test_bind_serializers_only_once() {
        let logger = Logger::new(Arc::new(VecSink::default()));
        logger
            .bind_serializers(&Serializers::standard(), &Serializers::new())
            .unwrap();

        let result = logger.bind_serializers(&Serializers::new(), &Serializers::new());

        assert_eq!(result, Err(ConfigError::InstanceAlreadyBound));
        assert!(logger.serializers().contains_key("req"));
    }

    #[test]
    fn test_serializers_apply_to_call_fields() {
        let sink = Arc::new(VecSink::default());
        let logger = Logger::new(sink.clone())
            .with_serializers(&Serializers::new().with("secret", |_| json!("[redacted]")));

        logger.info(fields(json!({"secret": "hunter2", "plain": 1})), "hello");

        let records = sink.0.lock().unwrap();
        assert_eq!(records[0].fields["secret"], json!("[redacted]"));
        assert_eq!(records[0].fields["plain"], json!(1));
        assert_eq!(records[0].msg.as_deref(), Some("hello"));
    }

    #[test]
    fn test_writer_sink_emits_json_lines() {
        let sink = WriterSink::new(Vec::new());
        let record = Record {
            level: Level::Warn,
            time: 42,
            msg: Some("request error".to_string()),
            fields: fields(json!({"tags": ["a"]})),
        };
        sink.write(&record);

        let buffer = sink.writer.into_inner().unwrap();
        let line = String::from_utf8(buffer).unwrap();
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["level"], json!("warn"));
        assert_eq!(parsed["time"], json!(42));
        assert_eq!(parsed["msg"], json!("request error"));
        assert_eq!(parsed["tags"], json!(["a"]));
    }
}
