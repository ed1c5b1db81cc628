//! Endpoints for dispatching events and introspecting the distribution
//! subsystem. All of them require an authenticated caller; the backend
//! decides recipients, never the browser.

use crate::controller::ApiResponse;
use crate::error::Result;
use crate::extractors::authenticated_user::AuthenticatedUser;
use crate::params::event::EventParams;
use ::sse::HandlerKind;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::*;
use serde::Serialize;
use service::AppState;

#[derive(Debug, Serialize)]
struct DeliveryReport {
    /// Connections on this instance that received the event. 0 can mean
    /// "delivered on a peer instance" or "queued for offline replay".
    delivered: usize,
}

#[derive(Debug, Serialize)]
struct ActiveBackend {
    active: String,
}

/// POST an event to one user's connections, fleet-wide.
pub async fn send_to_user(
    AuthenticatedUser(caller): AuthenticatedUser,
    State(app_state): State<AppState>,
    Path(user_id): Path<String>,
    Json(params): Json<EventParams>,
) -> Result<impl IntoResponse> {
    debug!("User {caller} dispatching {} event to {user_id}", params.event_type);
    let options = params.send_options();
    let delivered = app_state
        .event_manager
        .send_event_to_user(&user_id, params.into_event(), options)
        .await?;
    Ok(Json(ApiResponse::new(
        StatusCode::OK.into(),
        DeliveryReport { delivered },
    )))
}

/// POST an event to every connection, fleet-wide.
pub async fn broadcast(
    AuthenticatedUser(caller): AuthenticatedUser,
    State(app_state): State<AppState>,
    Json(params): Json<EventParams>,
) -> Result<impl IntoResponse> {
    debug!("User {caller} broadcasting {} event", params.event_type);
    let options = params.send_options();
    let delivered = app_state
        .event_manager
        .broadcast_event(params.into_event(), options)
        .await?;
    Ok(Json(ApiResponse::new(
        StatusCode::OK.into(),
        DeliveryReport { delivered },
    )))
}

/// GET the active backend's status report.
pub async fn status(
    AuthenticatedUser(_caller): AuthenticatedUser,
    State(app_state): State<AppState>,
) -> Result<impl IntoResponse> {
    let status = app_state.event_manager.status().await?;
    Ok(Json(ApiResponse::new(StatusCode::OK.into(), status)))
}

/// GET the aggregated delivery metrics.
pub async fn stats(
    AuthenticatedUser(_caller): AuthenticatedUser,
    State(app_state): State<AppState>,
) -> Result<impl IntoResponse> {
    let snapshot = app_state.event_manager.stats();
    Ok(Json(ApiResponse::new(StatusCode::OK.into(), snapshot)))
}

/// POST a switch to another delivery backend, migrating live connections.
pub async fn switch_handler(
    AuthenticatedUser(caller): AuthenticatedUser,
    State(app_state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Response> {
    let Ok(kind) = kind.parse::<HandlerKind>() else {
        return Ok((StatusCode::BAD_REQUEST, "unknown delivery backend").into_response());
    };
    info!("User {caller} requested a switch to the {kind} backend");
    let active = app_state.event_manager.switch_handler(kind).await?;
    Ok(Json(ApiResponse::new(
        StatusCode::OK.into(),
        ActiveBackend {
            active: active.to_string(),
        },
    ))
    .into_response())
}
