// Library exports for reqlog
// Makes modules accessible to tests and external usage

pub mod binder;
pub mod config;
pub mod error;
pub mod host;
pub mod level;
pub mod logger;
pub mod metrics;
pub mod serializers;
pub mod server;
pub mod tags;

pub use binder::bind;
pub use error::{ConfigError, HookError, InstrumentationError};
pub use host::{Continue, Host, LogEvent, Request};
pub use level::Level;
pub use logger::Logger;
pub use server::Server;
pub use tags::{TagLevelMap, TagResolver, dispatch, resolve_level};
