// Field serializers applied by the logger to well-known record keys

use crate::host::{Request, ResponseInfo};
use hyper::HeaderMap;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Structured fields of a log record.
pub type Fields = Map<String, Value>;

/// Transforms the value stored under one record key.
pub type SerializerFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

const REQ_KEYS: &[&str] = &["id", "method", "url", "headers", "remoteAddress", "remotePort"];
const RES_KEYS: &[&str] = &["statusCode", "headers"];
const ERR_KEYS: &[&str] = &["type", "message", "sources"];

/// Serializer table keyed by record field name.
#[derive(Clone, Default)]
pub struct Serializers {
    table: BTreeMap<String, SerializerFn>,
}

impl Serializers {
    pub fn new() -> Self {
        Serializers::default()
    }

    /// The `req`, `res` and `err` serializers used for request lifecycle records.
    pub fn standard() -> Self {
        Serializers::new()
            .with("req", |value| pick(value, REQ_KEYS))
            .with("res", |value| pick(value, RES_KEYS))
            .with("err", |value| pick(value, ERR_KEYS))
    }

    pub fn with<F>(mut self, key: impl Into<String>, serializer: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.insert(key, serializer);
        self
    }

    pub fn insert<F>(&mut self, key: impl Into<String>, serializer: F)
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.table.insert(key.into(), Arc::new(serializer));
    }

    pub fn get(&self, key: &str) -> Option<&SerializerFn> {
        self.table.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.table.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// New table holding every entry of `self`, with `overrides` winning on
    /// key collision.
    pub fn merged(&self, overrides: &Serializers) -> Serializers {
        let mut table = self.table.clone();
        for (key, serializer) in &overrides.table {
            table.insert(key.clone(), Arc::clone(serializer));
        }
        Serializers { table }
    }

    pub fn apply(&self, fields: &mut Fields) {
        for (key, value) in fields.iter_mut() {
            if let Some(serializer) = self.table.get(key) {
                *value = serializer(value);
            }
        }
    }
}

impl fmt::Debug for Serializers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.table.keys()).finish()
    }
}

/// Keep only `keys` of an object. Non-objects pass through untouched.
pub fn pick(value: &Value, keys: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| keys.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn headers_value(headers: &HeaderMap) -> Value {
    let mut out = Map::new();
    for name in headers.keys() {
        let values: Vec<Value> = headers
            .get_all(name)
            .iter()
            .map(|v| Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let value = match values.len() {
            1 => values.into_iter().next().unwrap_or(Value::Null),
            _ => Value::Array(values),
        };
        out.insert(name.as_str().to_string(), value);
    }
    Value::Object(out)
}

/// Raw request view: identity, method, url, headers and the transport peer.
pub fn raw_request(request: &Request) -> Value {
    json!({
        "id": request.id,
        "method": request.method.as_str(),
        "url": request.url,
        "headers": headers_value(&request.headers),
        "remoteAddress": request.remote.map(|addr| addr.ip().to_string()),
        "remotePort": request.remote.map(|addr| addr.port()),
    })
}

pub fn raw_response(response: Option<&ResponseInfo>) -> Value {
    match response {
        Some(response) => json!({
            "statusCode": response.status.as_u16(),
            "headers": headers_value(&response.headers),
        }),
        None => Value::Null,
    }
}

/// Message plus the `source()` chain of an error.
pub fn error_value(err: &(dyn std::error::Error + 'static)) -> Value {
    let mut sources = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        sources.push(Value::String(source.to_string()));
        current = source.source();
    }

    let mut value = Map::new();
    value.insert("message".to_string(), Value::String(err.to_string()));
    if !sources.is_empty() {
        value.insert("sources".to_string(), Value::Array(sources));
    }
    Value::Object(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merged_overrides_win() {
        let base = Serializers::new()
            .with("foo", |_| json!("base-foo"))
            .with("req", |_| json!("base-req"));
        let overrides = Serializers::new().with("req", |_| json!("override-req"));

        let merged = base.merged(&overrides);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get("foo").map(|s| s(&Value::Null)), Some(json!("base-foo")));
        assert_eq!(merged.get("req").map(|s| s(&Value::Null)), Some(json!("override-req")));
    }

    #[test]
    fn test_standard_serializers_filter_keys() {
        let mut fields = Fields::new();
        fields.insert(
            "res".to_string(),
            json!({"statusCode": 200, "headers": {}, "socket": "internal"}),
        );
        fields.insert("other".to_string(), json!({"socket": "kept"}));

        Serializers::standard().apply(&mut fields);

        assert_eq!(fields["res"], json!({"statusCode": 200, "headers": {}}));
        assert_eq!(fields["other"], json!({"socket": "kept"}));
    }

    #[test]
    fn test_error_value_includes_sources() {
        let outer = Wrapped(std::io::Error::other("disk full"));

        let value = error_value(&outer);
        assert_eq!(value["message"], json!("write failed"));
        assert_eq!(value["sources"], json!(["disk full"]));
    }

    #[derive(Debug)]
    struct Wrapped(std::io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("write failed")
        }
    }

    impl std::error::Error for Wrapped {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }
}
