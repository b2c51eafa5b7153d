// Demo server: config, subscriber, logger binding, routes

use anyhow::{Context, Result};
use hyper::{Method, StatusCode};
use reqlog::config::AppConfig;
use reqlog::server::{Reply, Server};
use reqlog::{bind, logger, metrics};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;

    logger::init_subscriber(&config.logger).context("Failed to initialize logger")?;

    tracing::info!(
        server_bind = %format!("{}:{}", config.server.bind_address, config.server.port),
        log_level = %config.logger.level,
        destination = ?config.logger.destination,
        fallback = %config.logger.fallback,
        tag_overrides = config.logger.tags.len(),
        "reqlog server starting"
    );

    let mut server = Server::new(config.server.clone());
    bind(&mut server, config.logger.clone()).context("Failed to bind request logger")?;

    server.route(Method::GET, "/", |_| Ok(Reply::text("ok\n")));

    server.route(Method::GET, "/metrics", |_| {
        Ok(Reply::text(metrics::gather()?))
    });

    // Echo the body back and log it under the tags given in ?tags=a,b
    server.route(Method::POST, "/echo", |request| {
        let tags: Vec<String> = request
            .query_param("tags")
            .map(|tags| {
                tags.split(',')
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let body = request.payload_value();
        request.log(tags.as_slice(), body.clone())?;
        Ok(Reply::json(&json!({ "id": request.id, "echo": body })))
    });

    server.route(Method::GET, "/fail", |_| Err("handler failed on purpose".into()));

    server.route(Method::GET, "/teapot", |_| {
        Ok(Reply::text("short and stout\n").with_status(StatusCode::IM_A_TEAPOT))
    });

    server.log(&["startup", "info"], json!({ "routes": 5 }))?;

    server.run().await.context("Server error")?;

    Ok(())
}
