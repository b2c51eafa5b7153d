//! Binds a structured logger to a host and to each of its requests.
//!
//! [`bind`] validates the whole configuration first and only then touches
//! the host: the server logger goes into `app().logger`, and seven hooks are
//! registered (request-start, log, request-log, request-error,
//! response-complete, post-start, post-stop). A rejected configuration leaves
//! the host exactly as it was.

use crate::config::{ChildBindings, LoggerConfig, check_ignore_paths};
use crate::error::{ConfigError, HookError, InstrumentationError};
use crate::host::{Continue, Hook, HookResult, Host, LogEvent, Request, ServerInfo};
use crate::logger::{Logger, build_sink};
use crate::metrics;
use crate::serializers::{Fields, Serializers, error_value, raw_request, raw_response};
use crate::tags::TagResolver;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Settings captured by the request hooks.
struct Binding {
    resolver: TagResolver,
    ignore_paths: HashSet<String>,
    child_bindings: Option<ChildBindings>,
    log_request_start: bool,
    log_request_complete: bool,
    log_payload: bool,
}

impl Binding {
    fn is_ignored(&self, request: &Request) -> bool {
        self.ignore_paths.contains(&request.path)
    }
}

pub fn bind<H: Host + ?Sized>(host: &mut H, config: LoggerConfig) -> Result<Logger, ConfigError> {
    let resolver = TagResolver::from_config(&config)?;
    check_ignore_paths(&config.ignore_paths)?;

    let logger = match &config.instance {
        Some(instance) => instance.clone(),
        None => {
            let sink = build_sink(&config.destination, config.pretty).map_err(|e| {
                ConfigError::Destination {
                    destination: format!("{:?}", config.destination),
                    reason: e.to_string(),
                }
            })?;
            Logger::new(sink).with_level(config.level)
        }
    };
    logger.bind_serializers(&Serializers::standard(), &config.serializers)?;

    let binding = Arc::new(Binding {
        resolver,
        ignore_paths: config.ignore_paths.iter().cloned().collect(),
        child_bindings: config.child_bindings.clone(),
        log_request_start: config.log_request_start,
        log_request_complete: config.log_request_complete,
        log_payload: config.log_payload,
    });

    host.app_mut().logger = Some(logger.clone());

    host.ext(Hook::RequestStart(Arc::new({
        let logger = logger.clone();
        let binding = Arc::clone(&binding);
        move |request: &mut Request| -> HookResult { on_request_start(&logger, &binding, request) }
    })));

    host.ext(Hook::Log(Arc::new({
        let logger = logger.clone();
        let binding = Arc::clone(&binding);
        move |event: &LogEvent| -> HookResult {
            binding.resolver.log_event(&logger, event);
            Ok(Continue)
        }
    })));

    host.ext(Hook::RequestLog(Arc::new({
        let binding = Arc::clone(&binding);
        move |request: &Request, event: &LogEvent| -> HookResult {
            binding.resolver.log_event(request_logger(request)?, event);
            Ok(Continue)
        }
    })));

    host.ext(Hook::RequestError(Arc::new(
        move |request: &Request, err: &(dyn std::error::Error + Send + Sync + 'static)| -> HookResult {
            let mut fields = Fields::new();
            fields.insert("res".to_string(), raw_response(request.response.as_ref()));
            fields.insert("err".to_string(), error_value(err));
            request_logger(request)?.warn(fields, "request error");
            Ok(Continue)
        },
    )));

    host.ext(Hook::ResponseComplete(Arc::new({
        let binding = Arc::clone(&binding);
        move |request: &Request| -> HookResult { on_response_complete(&binding, request) }
    })));

    host.ext(Hook::PostStart(Arc::new({
        let logger = logger.clone();
        move |info: &ServerInfo| -> HookResult {
            logger.info(server_fields(info), "server started");
            Ok(Continue)
        }
    })));

    host.ext(Hook::PostStop(Arc::new({
        let logger = logger.clone();
        move |info: &ServerInfo| -> HookResult {
            logger.info(server_fields(info), "server stopped");
            Ok(Continue)
        }
    })));

    tracing::debug!(
        level = %logger.level(),
        tag_levels = binding.resolver.map().len(),
        fallback = ?binding.resolver.fallback(),
        serializers = ?logger.serializers(),
        "Request logger bound"
    );

    Ok(logger)
}

/// Default child bindings: the raw request under `req`.
pub fn default_child_bindings(request: &Request) -> Fields {
    let mut fields = Fields::new();
    fields.insert("req".to_string(), raw_request(request));
    fields
}

/// `responded - received`, in milliseconds.
pub fn response_time(request: &Request) -> Result<u64, InstrumentationError> {
    let received = request
        .timing
        .received
        .ok_or_else(|| InstrumentationError::MissingReceived {
            request_id: request.id.clone(),
        })?;
    let responded = request
        .timing
        .responded
        .ok_or_else(|| InstrumentationError::MissingResponded {
            request_id: request.id.clone(),
        })?;

    responded
        .checked_sub(received)
        .ok_or_else(|| InstrumentationError::NegativeDuration {
            request_id: request.id.clone(),
            received,
            responded,
        })
}

fn request_logger(request: &Request) -> Result<&Logger, HookError> {
    request
        .logger()
        .ok_or_else(|| HookError::MissingRequestLogger {
            request_id: request.id.clone(),
        })
}

fn on_request_start(logger: &Logger, binding: &Binding, request: &mut Request) -> HookResult {
    let bindings = match &binding.child_bindings {
        Some(child_bindings) => (child_bindings.0)(request),
        None => default_child_bindings(request),
    };
    let child = logger.child(bindings);

    if binding.log_request_start && !binding.is_ignored(request) {
        child.info(Fields::new(), "request start");
    }

    request.app.logger = Some(child);
    Ok(Continue)
}

fn on_response_complete(binding: &Binding, request: &Request) -> HookResult {
    if !binding.log_request_complete || binding.is_ignored(request) {
        return Ok(Continue);
    }

    let elapsed = response_time(request)?;
    metrics::RESPONSE_TIME_MS.observe(elapsed as f64);

    let mut fields = Fields::new();
    fields.insert("res".to_string(), raw_response(request.response.as_ref()));
    fields.insert("responseTime".to_string(), Value::from(elapsed));
    if binding.log_payload {
        fields.insert("payload".to_string(), request.payload_value());
    }

    request_logger(request)?.info(fields, "request completed");
    Ok(Continue)
}

fn server_fields(info: &ServerInfo) -> Fields {
    match info.to_value() {
        Value::Object(fields) => fields,
        _ => Fields::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Hooks, RawRequest, Timing};

    fn request_with_timing(timing: Timing) -> Request {
        let mut request = Request::new(RawRequest::get("/"), Arc::new(Hooks::default()));
        request.timing = timing;
        request
    }

    #[test]
    fn test_response_time() {
        let request = request_with_timing(Timing {
            received: Some(1_000),
            responded: Some(1_250),
        });
        assert_eq!(response_time(&request), Ok(250));
    }

    #[test]
    fn test_response_time_zero() {
        let request = request_with_timing(Timing {
            received: Some(1_000),
            responded: Some(1_000),
        });
        assert_eq!(response_time(&request), Ok(0));
    }

    #[test]
    fn test_response_time_missing() {
        let request = request_with_timing(Timing {
            received: Some(1_000),
            responded: None,
        });
        assert!(matches!(
            response_time(&request),
            Err(InstrumentationError::MissingResponded { .. })
        ));

        let request = request_with_timing(Timing::default());
        assert!(matches!(
            response_time(&request),
            Err(InstrumentationError::MissingReceived { .. })
        ));
    }

    #[test]
    fn test_response_time_negative() {
        let request = request_with_timing(Timing {
            received: Some(2_000),
            responded: Some(1_000),
        });
        assert!(matches!(
            response_time(&request),
            Err(InstrumentationError::NegativeDuration { .. })
        ));
    }
}
