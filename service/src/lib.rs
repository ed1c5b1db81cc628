use config::Config;
use sse::Manager;
use std::sync::Arc;

pub mod config;
pub mod logging;

// Service-level state containing only infrastructure concerns
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub event_manager: Arc<Manager>,
}

impl AppState {
    pub fn new(app_config: Config, event_manager: &Arc<Manager>) -> Self {
        Self {
            config: app_config,
            event_manager: Arc::clone(event_manager),
        }
    }
}
