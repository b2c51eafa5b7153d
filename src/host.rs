//! Hook surface of the host server.
//!
//! A host exposes named extension points. Each hook is a synchronous closure
//! that hands control back by returning [`Continue`], or stops the pipeline
//! with a [`HookError`]. The host also carries a server-wide state bag
//! ([`ServerState`]) and, per request, a request state bag ([`RequestState`]).

use crate::error::HookError;
use crate::logger::{Logger, now_millis};
use crate::serializers::error_value;
use hyper::body::Bytes;
use hyper::{HeaderMap, Method, StatusCode, Uri};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Explicit hand-back signal returned by every hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continue;

pub type HookResult = Result<Continue, HookError>;

/// Error type handlers and request-error hooks deal in.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type RequestHook = Arc<dyn Fn(&mut Request) -> HookResult + Send + Sync>;
pub type LogHook = Arc<dyn Fn(&LogEvent) -> HookResult + Send + Sync>;
pub type RequestLogHook = Arc<dyn Fn(&Request, &LogEvent) -> HookResult + Send + Sync>;
pub type RequestErrorHook =
    Arc<dyn Fn(&Request, &(dyn std::error::Error + Send + Sync + 'static)) -> HookResult + Send + Sync>;
pub type ResponseHook = Arc<dyn Fn(&Request) -> HookResult + Send + Sync>;
pub type LifecycleHook = Arc<dyn Fn(&ServerInfo) -> HookResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtPoint {
    RequestStart,
    Log,
    RequestLog,
    RequestError,
    ResponseComplete,
    PostStart,
    PostStop,
}

/// A hook bound to its extension point.
#[derive(Clone)]
pub enum Hook {
    RequestStart(RequestHook),
    Log(LogHook),
    RequestLog(RequestLogHook),
    RequestError(RequestErrorHook),
    ResponseComplete(ResponseHook),
    PostStart(LifecycleHook),
    PostStop(LifecycleHook),
}

impl Hook {
    pub fn point(&self) -> ExtPoint {
        match self {
            Hook::RequestStart(_) => ExtPoint::RequestStart,
            Hook::Log(_) => ExtPoint::Log,
            Hook::RequestLog(_) => ExtPoint::RequestLog,
            Hook::RequestError(_) => ExtPoint::RequestError,
            Hook::ResponseComplete(_) => ExtPoint::ResponseComplete,
            Hook::PostStart(_) => ExtPoint::PostStart,
            Hook::PostStop(_) => ExtPoint::PostStop,
        }
    }
}

/// Registered hooks, run in registration order per extension point.
#[derive(Clone, Default)]
pub struct Hooks {
    request_start: Vec<RequestHook>,
    log: Vec<LogHook>,
    request_log: Vec<RequestLogHook>,
    request_error: Vec<RequestErrorHook>,
    response_complete: Vec<ResponseHook>,
    post_start: Vec<LifecycleHook>,
    post_stop: Vec<LifecycleHook>,
}

impl Hooks {
    pub fn add(&mut self, hook: Hook) {
        match hook {
            Hook::RequestStart(h) => self.request_start.push(h),
            Hook::Log(h) => self.log.push(h),
            Hook::RequestLog(h) => self.request_log.push(h),
            Hook::RequestError(h) => self.request_error.push(h),
            Hook::ResponseComplete(h) => self.response_complete.push(h),
            Hook::PostStart(h) => self.post_start.push(h),
            Hook::PostStop(h) => self.post_stop.push(h),
        }
    }

    pub fn count(&self, point: ExtPoint) -> usize {
        match point {
            ExtPoint::RequestStart => self.request_start.len(),
            ExtPoint::Log => self.log.len(),
            ExtPoint::RequestLog => self.request_log.len(),
            ExtPoint::RequestError => self.request_error.len(),
            ExtPoint::ResponseComplete => self.response_complete.len(),
            ExtPoint::PostStart => self.post_start.len(),
            ExtPoint::PostStop => self.post_stop.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.request_start.len()
            + self.log.len()
            + self.request_log.len()
            + self.request_error.len()
            + self.response_complete.len()
            + self.post_start.len()
            + self.post_stop.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn run_request_start(&self, request: &mut Request) -> Result<(), HookError> {
        for hook in &self.request_start {
            hook(request)?;
        }
        Ok(())
    }

    pub fn run_log(&self, event: &LogEvent) -> Result<(), HookError> {
        for hook in &self.log {
            hook(event)?;
        }
        Ok(())
    }

    pub fn run_request_log(&self, request: &Request, event: &LogEvent) -> Result<(), HookError> {
        for hook in &self.request_log {
            hook(request, event)?;
        }
        Ok(())
    }

    pub fn run_request_error(
        &self,
        request: &Request,
        err: &(dyn std::error::Error + Send + Sync + 'static),
    ) -> Result<(), HookError> {
        for hook in &self.request_error {
            hook(request, err)?;
        }
        Ok(())
    }

    pub fn run_response_complete(&self, request: &Request) -> Result<(), HookError> {
        for hook in &self.response_complete {
            hook(request)?;
        }
        Ok(())
    }

    pub fn run_post_start(&self, info: &ServerInfo) -> Result<(), HookError> {
        for hook in &self.post_start {
            hook(info)?;
        }
        Ok(())
    }

    pub fn run_post_stop(&self, info: &ServerInfo) -> Result<(), HookError> {
        for hook in &self.post_stop {
            hook(info)?;
        }
        Ok(())
    }
}

/// Server-wide state bag.
#[derive(Debug, Clone, Default)]
pub struct ServerState {
    pub logger: Option<Logger>,
}

/// Per-request state bag.
#[derive(Debug, Clone, Default)]
pub struct RequestState {
    pub logger: Option<Logger>,
}

/// Descriptive server information, logged on start and stop.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub uri: String,
    pub created: u64,
    pub started: Option<u64>,
}

impl ServerInfo {
    pub fn new(host: &str, port: u16) -> Self {
        ServerInfo {
            id: Uuid::new_v4().to_string(),
            host: host.to_string(),
            port,
            protocol: "http".to_string(),
            uri: format!("http://{}:{}", host, port),
            created: now_millis(),
            started: None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A tagged event, from the server (`Log`) or a request (`RequestLog`).
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub tags: Vec<String>,
    pub data: Option<Value>,
    pub error: Option<Value>,
    pub timestamp: u64,
}

impl LogEvent {
    pub fn new<S: AsRef<str>>(tags: &[S], data: Option<Value>) -> Self {
        LogEvent {
            tags: tags.iter().map(|t| t.as_ref().to_string()).collect(),
            data,
            error: None,
            timestamp: now_millis(),
        }
    }

    pub fn from_error<S: AsRef<str>>(tags: &[S], err: &(dyn std::error::Error + 'static)) -> Self {
        LogEvent {
            tags: tags.iter().map(|t| t.as_ref().to_string()).collect(),
            data: None,
            error: Some(error_value(err)),
            timestamp: now_millis(),
        }
    }
}

/// Received/responded instrumentation, milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    pub received: Option<u64>,
    pub responded: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Raw transport view of one inbound request.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote: Option<SocketAddr>,
    pub payload: Bytes,
}

impl RawRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        RawRequest {
            method,
            uri,
            headers: HeaderMap::new(),
            remote: None,
            payload: Bytes::new(),
        }
    }

    pub fn get(path: &str) -> Self {
        RawRequest::new(Method::GET, path.parse().unwrap_or_default())
    }

    pub fn post(path: &str, payload: impl Into<Bytes>) -> Self {
        RawRequest::new(Method::POST, path.parse().unwrap_or_default()).payload(payload)
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.append(name, value);
        }
        self
    }

    pub fn remote(mut self, addr: SocketAddr) -> Self {
        self.remote = Some(addr);
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// An in-flight request as hooks and handlers see it.
pub struct Request {
    pub id: String,
    pub method: Method,
    pub url: String,
    pub path: String,
    pub headers: HeaderMap,
    pub remote: Option<SocketAddr>,
    pub payload: Bytes,
    pub timing: Timing,
    pub response: Option<ResponseInfo>,
    pub app: RequestState,
    hooks: Arc<Hooks>,
}

impl Request {
    /// Stamp `received` and take the id from `x-request-id` when the client
    /// sent one.
    pub fn new(raw: RawRequest, hooks: Arc<Hooks>) -> Self {
        let id = raw
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let url = raw
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Request {
            id,
            method: raw.method,
            path: raw.uri.path().to_string(),
            url,
            headers: raw.headers,
            remote: raw.remote,
            payload: raw.payload,
            timing: Timing {
                received: Some(now_millis()),
                responded: None,
            },
            response: None,
            app: RequestState::default(),
            hooks,
        }
    }

    pub fn logger(&self) -> Option<&Logger> {
        self.app.logger.as_ref()
    }

    /// Emit a tagged event on this request.
    pub fn log<S: AsRef<str>>(&self, tags: &[S], data: Value) -> Result<(), HookError> {
        let hooks = Arc::clone(&self.hooks);
        hooks.run_request_log(self, &LogEvent::new(tags, Some(data)))
    }

    pub fn log_error<S: AsRef<str>>(
        &self,
        tags: &[S],
        err: &(dyn std::error::Error + 'static),
    ) -> Result<(), HookError> {
        let hooks = Arc::clone(&self.hooks);
        hooks.run_request_log(self, &LogEvent::from_error(tags, err))
    }

    /// First value of `name` in the query string, undecoded. A bare key
    /// yields an empty value.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let (_, query) = self.url.split_once('?')?;
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
    }

    /// Payload as JSON when it parses, as text otherwise.
    pub fn payload_value(&self) -> Value {
        if self.payload.is_empty() {
            return Value::Null;
        }
        serde_json::from_slice(&self.payload).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&self.payload).into_owned())
        })
    }
}

/// What a server must offer for a logger to be bound to it.
pub trait Host {
    /// Register one hook on its extension point.
    fn ext(&mut self, hook: Hook);

    fn app(&self) -> &ServerState;

    fn app_mut(&mut self) -> &mut ServerState;

    fn hook_count(&self) -> usize;

    /// Same handle as `app().logger`.
    fn logger(&self) -> Option<&Logger> {
        self.app().logger.as_ref()
    }
}
