use axum::http::StatusCode;
use axum::response::IntoResponse;

/// GET liveness probe; returns 200 while the router is serving requests.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "healthy")
}
