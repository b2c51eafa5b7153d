// Error taxonomy for binding and per-request hooks

use thiserror::Error;

/// Rejected logger configuration. Raised by `bind` before anything is
/// registered on the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("tag {tag:?} maps to invalid level {value:?}")]
    InvalidTagLevel { tag: String, value: String },

    #[error("invalid fallback level {0:?} (expected a level name or \"none\")")]
    InvalidFallback(String),

    #[error("cannot open log destination {destination}: {reason}")]
    Destination { destination: String, reason: String },

    #[error("ignore_paths entry {0:?} must start with '/'")]
    InvalidIgnorePath(String),

    #[error("logger instance is already bound to a host")]
    InstanceAlreadyBound,
}

/// Response timing could not be turned into an elapsed duration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstrumentationError {
    #[error("request {request_id} has no received timestamp")]
    MissingReceived { request_id: String },

    #[error("request {request_id} has no responded timestamp")]
    MissingResponded { request_id: String },

    #[error("request {request_id} responded at {responded} before it was received at {received}")]
    NegativeDuration {
        request_id: String,
        received: u64,
        responded: u64,
    },
}

/// Failure returned by a hook instead of the `Continue` signal.
#[derive(Debug, Error)]
pub enum HookError {
    #[error(transparent)]
    Instrumentation(#[from] InstrumentationError),

    #[error("request {request_id} has no logger attached")]
    MissingRequestLogger { request_id: String },
}
