//! HTTP surface for the event distribution subsystem: the `/sse` stream
//! endpoint, the event dispatch and introspection endpoints, and a health
//! check.

use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use log::*;
use service::AppState;
use tower_http::cors::CorsLayer;

pub(crate) mod controller;
pub mod error;
pub(crate) mod extractors;
pub(crate) mod params;
pub mod router;
pub(crate) mod sse;

pub use error::{Error, Result};

/// Binds the listener and serves the router until shutdown is signalled.
/// The event manager is stopped after the listener drains so in-flight
/// streams see their final frames.
pub async fn init_server(app_state: AppState) -> std::io::Result<()> {
    let interface = app_state
        .config
        .interface
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = app_state.config.port;

    let cors = cors_layer(&app_state.config.allowed_origins);
    let event_manager = app_state.event_manager.clone();
    let router = router::define_routes(app_state).layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("{interface}:{port}")).await?;
    info!("Server starting... listening for requests on {interface}:{port}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    event_manager.shutdown().await;
    Ok(())
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Skipping unparseable CORS origin {origin}");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal: {e}");
    }
    info!("Shutdown signal received; draining connections");
}
