use crate::error::Result;
use crate::extractors::authenticated_user::AuthenticatedUser;
use ::sse::wire;
use ::sse::{ConnectionId, ConnectionMetadata};
use async_stream::stream;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::Response;
use events::Event;
use log::*;
use serde_json::json;
use service::AppState;
use std::convert::Infallible;
use tokio::sync::mpsc;

/// SSE handler that establishes a long-lived connection for real-time
/// updates.
///
/// The first frame on every stream is a `connected` event carrying the
/// reconnect delay; it is written before the connection is registered so it
/// precedes any offline-queue replay. A heartbeat task keeps the stream warm
/// and refreshes the connection's activity clock; when the heartbeat write
/// fails the client is gone and the connection is deregistered. A silent
/// client drop without a failing write is caught by the lifecycle sweep.
pub(crate) async fn sse_stream(
    AuthenticatedUser(user_id): AuthenticatedUser,
    State(app_state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    debug!("Establishing SSE connection for user {user_id}");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection_id = ConnectionId::new();
    let metadata = ConnectionMetadata {
        role: None,
        client_kind: header_value(&headers, header::USER_AGENT),
        origin: header_value(&headers, header::ORIGIN),
    };

    let connected = Event::new(
        "connected",
        json!({ "connection_id": connection_id.as_str(), "user_id": user_id }),
    )
    .with_retry(app_state.config.client_retry_ms);
    let _ = tx.send(wire::frame_event(&connected)?);

    app_state
        .event_manager
        .add_client(connection_id.clone(), user_id.clone(), tx.clone(), metadata)
        .await?;

    spawn_heartbeat(&app_state, connection_id, user_id, tx);

    let stream = stream! {
        while let Some(frame) = rx.recv().await {
            yield Ok::<String, Infallible>(frame);
        }
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .map_err(|e| ::sse::Error::other(format!("failed to build stream response: {e}")).into())
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

fn spawn_heartbeat(
    app_state: &AppState,
    connection_id: ConnectionId,
    user_id: String,
    tx: mpsc::UnboundedSender<String>,
) {
    let manager = app_state.event_manager.clone();
    let interval = app_state.config.heartbeat_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick fires immediately

        loop {
            ticker.tick().await;
            let frame = match wire::frame_event(&Event::new("ping", json!({}))) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Heartbeat framing failed: {e}");
                    continue;
                }
            };
            if tx.send(frame).is_err() {
                debug!("SSE connection closed for user {user_id}, cleaning up");
                manager.remove_client(&connection_id).await;
                return;
            }
            manager.update_client_activity(&connection_id).await;
        }
    });
}
