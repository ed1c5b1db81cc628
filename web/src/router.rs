use crate::controller::{event_controller, health_check_controller};
use crate::sse::handler as sse_handler;
use axum::{
    routing::{get, post},
    Router,
};
use service::AppState;

pub fn define_routes(app_state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(sse_routes(app_state.clone()))
        .merge(event_routes(app_state))
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn sse_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/sse", get(sse_handler::sse_stream))
        .with_state(app_state)
}

fn event_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/events/users/:user_id", post(event_controller::send_to_user))
        .route("/events/broadcast", post(event_controller::broadcast))
        .route("/events/status", get(event_controller::status))
        .route("/events/stats", get(event_controller::stats))
        .route(
            "/events/handler/:kind",
            post(event_controller::switch_handler),
        )
        .with_state(app_state)
}
