// HTTP server implementing the hook surface
// One tokio task per connection; the request pipeline runs the hooks inline

use crate::config::ServerConfig;
use crate::error::HookError;
use crate::host::{
    BoxError, Hook, Hooks, Host, LogEvent, RawRequest, Request, ResponseInfo, ServerInfo,
    ServerState,
};
use crate::logger::now_millis;
use anyhow::{Context, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub type Handler = Arc<dyn Fn(&mut Request) -> Result<Reply, BoxError> + Send + Sync>;

/// Handler output.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn status(status: StatusCode) -> Self {
        Reply {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        let mut reply = Reply::status(StatusCode::OK);
        reply.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        reply.body = Bytes::from(body.into());
        reply
    }

    pub fn json(value: &Value) -> Self {
        let mut reply = Reply::status(StatusCode::OK);
        reply
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        reply.body = Bytes::from(value.to_string());
        reply
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

pub struct Server {
    config: ServerConfig,
    info: ServerInfo,
    app: ServerState,
    hooks: Arc<Hooks>,
    routes: HashMap<(Method, String), Handler>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let info = ServerInfo::new(&config.bind_address, config.port);

        Server {
            config,
            info,
            app: ServerState::default(),
            hooks: Arc::new(Hooks::default()),
            routes: HashMap::new(),
        }
    }

    pub fn route<F>(&mut self, method: Method, path: &str, handler: F)
    where
        F: Fn(&mut Request) -> Result<Reply, BoxError> + Send + Sync + 'static,
    {
        self.routes
            .insert((method, path.to_string()), Arc::new(handler));
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Emit a server-level tagged event.
    pub fn log<S: AsRef<str>>(&self, tags: &[S], data: Value) -> Result<(), HookError> {
        self.hooks.run_log(&LogEvent::new(tags, Some(data)))
    }

    pub fn log_error<S: AsRef<str>>(
        &self,
        tags: &[S],
        err: &(dyn std::error::Error + 'static),
    ) -> Result<(), HookError> {
        self.hooks.run_log(&LogEvent::from_error(tags, err))
    }

    pub fn start(&mut self) -> Result<(), HookError> {
        self.info.started = Some(now_millis());
        self.hooks.run_post_start(&self.info)
    }

    pub fn stop(&self) -> Result<(), HookError> {
        self.hooks.run_post_stop(&self.info)
    }

    /// Run one request through the full pipeline: request-start hooks, the
    /// route handler, request-error hooks on handler failure, then
    /// response-complete hooks.
    pub fn inject(&self, raw: RawRequest) -> Result<Reply, HookError> {
        let mut request = Request::new(raw, Arc::clone(&self.hooks));
        self.hooks.run_request_start(&mut request)?;

        let handler = self
            .routes
            .get(&(request.method.clone(), request.path.clone()))
            .cloned();

        let reply = match handler {
            Some(handler) => match handler(&mut request) {
                Ok(reply) => reply,
                Err(err) => {
                    let reply = Reply::status(StatusCode::INTERNAL_SERVER_ERROR);
                    request.response = Some(ResponseInfo {
                        status: reply.status,
                        headers: reply.headers.clone(),
                    });
                    self.hooks.run_request_error(&request, &*err)?;
                    reply
                }
            },
            None => Reply::status(StatusCode::NOT_FOUND),
        };

        request.response = Some(ResponseInfo {
            status: reply.status,
            headers: reply.headers.clone(),
        });
        request.timing.responded = Some(now_millis());
        self.hooks.run_response_complete(&request)?;

        Ok(reply)
    }

    /// Accept loop. Runs until the listener fails fatally or the task is dropped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        tracing::info!(address = %addr, "HTTP server listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let server = Arc::clone(&server);
                            async move { server.handle(req, peer_addr).await }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            tracing::warn!(
                                peer = %peer_addr,
                                error = %e,
                                "Connection handling error"
                            );
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Bind the configured address, fire post-start, serve until Ctrl+C,
    /// then fire post-stop.
    pub async fn run(mut self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        self.start().context("post-start hook failed")?;
        let server = Arc::new(self);

        tokio::select! {
            result = Arc::clone(&server).serve(listener) => result?,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                tracing::info!("Shutdown signal received");
            }
        }

        server.stop().context("post-stop hook failed")?;
        Ok(())
    }

    async fn handle(
        &self,
        req: hyper::Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Result<hyper::Response<Full<Bytes>>, hyper::Error> {
        let (parts, body) = req.into_parts();
        let payload = body.collect().await?.to_bytes();

        let raw = RawRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            remote: Some(peer_addr),
            payload,
        };

        let reply = match self.inject(raw) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(peer = %peer_addr, error = %e, "Request hook failed");
                Reply::status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };

        let mut response = hyper::Response::new(Full::new(reply.body));
        *response.status_mut() = reply.status;
        *response.headers_mut() = reply.headers;
        Ok(response)
    }
}

impl Host for Server {
    fn ext(&mut self, hook: Hook) {
        tracing::trace!(point = ?hook.point(), "Hook registered");
        Arc::make_mut(&mut self.hooks).add(hook);
    }

    fn app(&self) -> &ServerState {
        &self.app
    }

    fn app_mut(&mut self) -> &mut ServerState {
        &mut self.app
    }

    fn hook_count(&self) -> usize {
        self.hooks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Continue;
    use std::sync::Mutex;

    #[test]
    fn test_unknown_route_is_404() {
        let server = Server::new(ServerConfig::default());
        let reply = server.inject(RawRequest::get("/missing")).unwrap();
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_pipeline_hook_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut server = Server::new(ServerConfig::default());

        let s = Arc::clone(&seen);
        server.ext(Hook::RequestStart(Arc::new(move |_: &mut Request| -> crate::host::HookResult {
            s.lock().unwrap().push("start");
            Ok(Continue)
        })));
        let s = Arc::clone(&seen);
        server.ext(Hook::RequestError(Arc::new(
            move |_: &Request, _: &(dyn std::error::Error + Send + Sync + 'static)| -> crate::host::HookResult {
                s.lock().unwrap().push("error");
                Ok(Continue)
            },
        )));
        let s = Arc::clone(&seen);
        server.ext(Hook::ResponseComplete(Arc::new(move |request: &Request| -> crate::host::HookResult {
            assert!(request.timing.responded.is_some());
            s.lock().unwrap().push("complete");
            Ok(Continue)
        })));
        server.route(Method::GET, "/fail", |_| Err("boom".into()));

        let reply = server.inject(RawRequest::get("/fail")).unwrap();

        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(*seen.lock().unwrap(), vec!["start", "error", "complete"]);
        assert_eq!(server.hook_count(), 3);
    }
}
