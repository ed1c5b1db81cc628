use log::{error, info};
use service::{config::Config, logging::Logger};
use sse::{default_factories, HandlerSelector, Manager, MetricsCollector};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = Config::new();
    Logger::init_logger(&config as &Config);

    info!("Starting the Pulse event distribution service...");

    let metrics = Arc::new(MetricsCollector::new(config.metrics_reset_window()));
    let backend_settings = config.backend_settings();
    let factories = default_factories(&backend_settings, metrics.clone());
    let selector = Arc::new(HandlerSelector::new(
        factories,
        backend_settings.init_timeout,
        metrics.clone(),
    ));
    let manager = Arc::new(Manager::new(selector, metrics, config.lifecycle_settings()));

    match manager.start().await {
        Ok(kind) => info!("Delivery backend ready: {kind}"),
        Err(e) => {
            error!("Failed to start event distribution: {e}");
            std::process::exit(1);
        }
    }

    let app_state = service::AppState::new(config, &manager);

    if let Err(e) = web::init_server(app_state).await {
        error!("Server exited with error: {e}");
        std::process::exit(1);
    }
}
