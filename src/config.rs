// Configuration module for the request logger and its server
// Precedence: CLI > file > env > defaults

use crate::error::ConfigError;
use crate::host::Request;
use crate::level::Level;
use crate::logger::Logger;
use crate::serializers::{Fields, Serializers};
use crate::tags::TagResolver;
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Where a binder-constructed logger writes its records.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum Destination {
    #[default]
    Stdout,
    Stderr,
    Tracing,
    File(PathBuf),
}

impl FromStr for Destination {
    type Err = Infallible;

    // Anything that is not a stream name is a file path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "stdout" => Destination::Stdout,
            "stderr" => Destination::Stderr,
            "tracing" => Destination::Tracing,
            _ => Destination::File(PathBuf::from(s)),
        })
    }
}

/// Computes the bound fields of a request's child logger.
#[derive(Clone)]
pub struct ChildBindings(pub Arc<dyn Fn(&Request) -> Fields + Send + Sync>);

impl ChildBindings {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Request) -> Fields + Send + Sync + 'static,
    {
        ChildBindings(Arc::new(f))
    }
}

impl fmt::Debug for ChildBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChildBindings(..)")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggerConfig {
    #[serde(default)]
    pub destination: Destination,

    #[serde(default)]
    pub pretty: bool,

    #[serde(default)]
    pub level: Level,

    /// Tag → level overrides, applied over the built-in level-name tags.
    /// Values are validated when the logger is bound.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Level for events whose tags match nothing, or "none" to drop them.
    #[serde(default = "default_fallback")]
    pub fallback: String,

    #[serde(default)]
    pub ignore_paths: Vec<String>,

    #[serde(default)]
    pub ignore_tags: Vec<String>,

    #[serde(default)]
    pub merge_data: bool,

    #[serde(default)]
    pub log_request_start: bool,

    #[serde(default = "default_true")]
    pub log_request_complete: bool,

    #[serde(default)]
    pub log_payload: bool,

    /// Reused instead of building a logger from `destination`.
    #[serde(skip)]
    pub instance: Option<Logger>,

    #[serde(skip)]
    pub serializers: Serializers,

    #[serde(skip)]
    pub child_bindings: Option<ChildBindings>,
}

fn default_fallback() -> String {
    Level::Info.as_str().to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            destination: Destination::default(),
            pretty: false,
            level: Level::default(),
            tags: BTreeMap::new(),
            fallback: default_fallback(),
            ignore_paths: Vec::new(),
            ignore_tags: Vec::new(),
            merge_data: false,
            log_request_start: false,
            log_request_complete: true,
            log_payload: false,
            instance: None,
            serializers: Serializers::new(),
            child_bindings: None,
        }
    }
}

impl LoggerConfig {
    pub fn with_tag(mut self, tag: impl Into<String>, level: impl Into<String>) -> Self {
        self.tags.insert(tag.into(), level.into());
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    pub fn with_instance(mut self, instance: Logger) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn with_serializers(mut self, serializers: Serializers) -> Self {
        self.serializers = serializers;
        self
    }

    pub fn with_child_bindings<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> Fields + Send + Sync + 'static,
    {
        self.child_bindings = Some(ChildBindings::new(f));
        self
    }

    /// Checks everything `bind` would reject, without side effects.
    pub fn check(&self) -> Result<(), ConfigError> {
        TagResolver::from_config(self)?;
        check_ignore_paths(&self.ignore_paths)?;
        Ok(())
    }
}

pub fn check_ignore_paths(paths: &[String]) -> Result<(), ConfigError> {
    match paths.iter().find(|p| !p.starts_with('/')) {
        Some(bad) => Err(ConfigError::InvalidIgnorePath(bad.clone())),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: default_port(),
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logger: LoggerConfig,
}

#[derive(Debug, Parser)]
#[command(name = "reqlog-server")]
#[command(about = "HTTP server with tagged request logging", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    pub bind: Option<String>,

    /// Minimum record level
    #[arg(long, value_enum)]
    pub log_level: Option<Level>,

    /// stdout, stderr, tracing, or a file path
    #[arg(long)]
    pub log_destination: Option<Destination>,

    /// Indented JSON records
    #[arg(long)]
    pub pretty: bool,

    /// Level for unmatched tags, or "none"
    #[arg(long)]
    pub fallback: Option<String>,

    /// Tag override as tag=level (repeatable)
    #[arg(long = "tag", value_name = "TAG=LEVEL")]
    pub tags: Vec<String>,

    /// Path whose request records are skipped (repeatable)
    #[arg(long = "ignore-path")]
    pub ignore_paths: Vec<String>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("port must be between 1 and 65535");
        }

        if self.server.bind_address.is_empty() {
            anyhow::bail!("bind_address must not be empty");
        }

        self.logger.check()?;

        Ok(())
    }

    pub fn load() -> Result<Self> {
        let cli_args = CliArgs::parse();

        let mut config = AppConfig::default();

        if cli_args.config.is_none() {
            config = Self::load_from_env(config, |key| std::env::var(key).ok())?;
        }

        if let Some(config_path) = &cli_args.config {
            config = Self::load_from_file(config_path)?;
        }

        config = Self::apply_cli_overrides(config, cli_args)?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    /// Reads `REQLOG_*` variables through `lookup`.
    pub fn load_from_env<F>(mut config: AppConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("REQLOG_PORT") {
            config.server.port = port.parse().context("Invalid REQLOG_PORT")?;
        }

        if let Some(bind) = lookup("REQLOG_BIND") {
            config.server.bind_address = bind;
        }

        if let Some(level) = lookup("REQLOG_LOG_LEVEL") {
            config.logger.level = level
                .to_lowercase()
                .parse()
                .with_context(|| format!("Invalid log level: {}", level))?;
        }

        if let Some(destination) = lookup("REQLOG_LOG_DESTINATION") {
            config.logger.destination = match destination.parse() {
                Ok(destination) => destination,
                Err(never) => match never {},
            };
        }

        if let Some(pretty) = lookup("REQLOG_LOG_PRETTY") {
            config.logger.pretty = match pretty.to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => anyhow::bail!("Invalid REQLOG_LOG_PRETTY: {}", pretty),
            };
        }

        if let Some(fallback) = lookup("REQLOG_FALLBACK") {
            config.logger.fallback = fallback;
        }

        if let Some(tags) = lookup("REQLOG_TAGS") {
            for pair in tags.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (tag, level) = parse_tag_pair(pair)?;
                config.logger.tags.insert(tag, level);
            }
        }

        if let Some(paths) = lookup("REQLOG_IGNORE_PATHS") {
            config.logger.ignore_paths = paths
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(config)
    }

    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    pub fn apply_cli_overrides(mut config: AppConfig, cli: CliArgs) -> Result<Self> {
        if let Some(port) = cli.port {
            config.server.port = port;
        }

        if let Some(bind) = cli.bind {
            config.server.bind_address = bind;
        }

        if let Some(level) = cli.log_level {
            config.logger.level = level;
        }

        if let Some(destination) = cli.log_destination {
            config.logger.destination = destination;
        }

        if cli.pretty {
            config.logger.pretty = true;
        }

        if let Some(fallback) = cli.fallback {
            config.logger.fallback = fallback;
        }

        for pair in &cli.tags {
            let (tag, level) = parse_tag_pair(pair)?;
            config.logger.tags.insert(tag, level);
        }

        if !cli.ignore_paths.is_empty() {
            config.logger.ignore_paths = cli.ignore_paths;
        }

        Ok(config)
    }
}

// The level half is kept raw; bind-time validation owns rejecting it.
fn parse_tag_pair(pair: &str) -> Result<(String, String)> {
    match pair.split_once('=') {
        Some((tag, level)) if !tag.trim().is_empty() => {
            Ok((tag.trim().to_string(), level.trim().to_string()))
        }
        _ => anyhow::bail!("Invalid tag override {:?}, expected tag=level", pair),
    }
}
