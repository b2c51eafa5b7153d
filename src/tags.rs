//! Tag-to-level resolution.
//!
//! Events carry free-form tags. A [`TagLevelMap`] says which tags imply a
//! severity; the first tag in an event's list that has a mapping decides the
//! level. Order matters: `[aaa, bbb]` with `aaa → info, bbb → warn` resolves
//! to `info`, never to the more severe `warn`. When nothing matches, the
//! fallback applies, and a `None` fallback suppresses the event.

use crate::config::LoggerConfig;
use crate::error::ConfigError;
use crate::host::LogEvent;
use crate::level::Level;
use crate::logger::Logger;
use crate::metrics;
use crate::serializers::Fields;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Built-in mapping: each level name tags its own level.
pub const DEFAULT_TAG_LEVELS: [(&str, Level); 5] = [
    ("trace", Level::Trace),
    ("debug", Level::Debug),
    ("info", Level::Info),
    ("warn", Level::Warn),
    ("error", Level::Error),
];

/// Fallback config value that disables logging of unmatched events.
pub const FALLBACK_NONE: &str = "none";

/// Immutable tag → level table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagLevelMap {
    levels: HashMap<String, Level>,
}

impl TagLevelMap {
    pub fn defaults() -> Self {
        TagLevelMap {
            levels: DEFAULT_TAG_LEVELS
                .iter()
                .map(|(tag, level)| (tag.to_string(), *level))
                .collect(),
        }
    }

    /// Defaults, then every override applied on top. All override values are
    /// parsed before any is applied, so one bad entry rejects the whole set.
    pub fn with_overrides<I, K, V>(overrides: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let parsed = overrides
            .into_iter()
            .map(|(tag, value)| {
                let tag = tag.into();
                match value.as_ref().parse::<Level>() {
                    Ok(level) => Ok((tag, level)),
                    Err(_) => Err(ConfigError::InvalidTagLevel {
                        tag,
                        value: value.as_ref().to_string(),
                    }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut map = TagLevelMap::defaults();
        map.levels.extend(parsed);
        Ok(map)
    }

    pub fn from_levels<I, K>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, Level)>,
        K: Into<String>,
    {
        let mut map = TagLevelMap::defaults();
        map.levels
            .extend(overrides.into_iter().map(|(tag, level)| (tag.into(), level)));
        map
    }

    pub fn get(&self, tag: &str) -> Option<Level> {
        self.levels.get(tag).copied()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

impl Default for TagLevelMap {
    fn default() -> Self {
        TagLevelMap::defaults()
    }
}

/// Parse a fallback setting: a level name, or `"none"` for suppression.
pub fn parse_fallback(raw: &str) -> Result<Option<Level>, ConfigError> {
    if raw == FALLBACK_NONE {
        return Ok(None);
    }
    raw.parse::<Level>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidFallback(raw.to_string()))
}

/// Level of the first tag with a mapping, or `fallback` when none has one.
pub fn resolve_level<S: AsRef<str>>(
    map: &TagLevelMap,
    fallback: Option<Level>,
    tags: &[S],
) -> Option<Level> {
    tags.iter()
        .find_map(|tag| map.get(tag.as_ref()))
        .or(fallback)
}

/// Write `{tags, data}` at `level`. `None` writes nothing.
pub fn dispatch<S: AsRef<str>>(logger: &Logger, level: Option<Level>, tags: &[S], payload: Value) {
    let Some(level) = level else {
        metrics::EVENTS_SUPPRESSED_TOTAL.inc();
        return;
    };

    let mut fields = Fields::new();
    fields.insert("tags".to_string(), tags_value(tags));
    fields.insert("data".to_string(), payload);
    logger.log(level, fields, None);
}

fn tags_value<S: AsRef<str>>(tags: &[S]) -> Value {
    Value::Array(
        tags.iter()
            .map(|tag| Value::String(tag.as_ref().to_string()))
            .collect(),
    )
}

/// Resolution settings shared by every tagged-event hook.
#[derive(Debug, Clone)]
pub struct TagResolver {
    map: TagLevelMap,
    fallback: Option<Level>,
    ignore_tags: HashSet<String>,
    merge_data: bool,
}

impl TagResolver {
    pub fn new(map: TagLevelMap, fallback: Option<Level>) -> Self {
        TagResolver {
            map,
            fallback,
            ignore_tags: HashSet::new(),
            merge_data: false,
        }
    }

    /// Validate the tag overrides and fallback of a logger configuration.
    pub fn from_config(config: &LoggerConfig) -> Result<Self, ConfigError> {
        let map = TagLevelMap::with_overrides(&config.tags)?;
        let fallback = parse_fallback(&config.fallback)?;

        Ok(TagResolver::new(map, fallback)
            .ignore_tags(config.ignore_tags.iter().cloned())
            .merge_data(config.merge_data))
    }

    pub fn ignore_tags<I: IntoIterator<Item = String>>(mut self, tags: I) -> Self {
        self.ignore_tags.extend(tags);
        self
    }

    pub fn merge_data(mut self, merge: bool) -> Self {
        self.merge_data = merge;
        self
    }

    pub fn map(&self) -> &TagLevelMap {
        &self.map
    }

    pub fn fallback(&self) -> Option<Level> {
        self.fallback
    }

    pub fn resolve<S: AsRef<str>>(&self, tags: &[S]) -> Option<Level> {
        resolve_level(&self.map, self.fallback, tags)
    }

    fn is_ignored<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        tags.iter()
            .any(|tag| self.ignore_tags.contains(tag.as_ref()))
    }

    /// Resolve and write one tagged event. Returns the level written at.
    pub fn log_event(&self, logger: &Logger, event: &LogEvent) -> Option<Level> {
        if self.is_ignored(event.tags.as_slice()) {
            metrics::EVENTS_SUPPRESSED_TOTAL.inc();
            return None;
        }

        let level = self.resolve(event.tags.as_slice());

        if let Some(err) = &event.error {
            let Some(level) = level else {
                metrics::EVENTS_SUPPRESSED_TOTAL.inc();
                return None;
            };
            let mut fields = Fields::new();
            fields.insert("tags".to_string(), tags_value(event.tags.as_slice()));
            fields.insert("err".to_string(), err.clone());
            logger.log(level, fields, None);
            return Some(level);
        }

        let data = event.data.clone().unwrap_or(Value::Null);
        if !self.merge_data {
            dispatch(logger, level, event.tags.as_slice(), data);
            return level;
        }

        let Some(level) = level else {
            metrics::EVENTS_SUPPRESSED_TOTAL.inc();
            return None;
        };
        let mut fields = Fields::new();
        fields.insert("tags".to_string(), tags_value(event.tags.as_slice()));
        match data {
            Value::Object(map) => {
                fields.extend(map);
                logger.log(level, fields, None);
            }
            Value::String(msg) => logger.log(level, fields, Some(&msg)),
            other => {
                fields.insert("data".to_string(), other);
                logger.log(level, fields, None);
            }
        }
        Some(level)
    }
}
