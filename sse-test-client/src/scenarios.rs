use crate::api_client::{ApiClient, Identity};
use crate::cache::{CachedEvent, EventCache};
use crate::output::TestResult;
use crate::sse_client::Connection;
use anyhow::Result;
use chrono::Utc;
use colored::*;
use serde_json::json;
use std::time::Duration;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE_WINDOW: Duration = Duration::from_secs(2);

/// Both users should receive a `connected` event carrying their own user id
/// as soon as the stream opens.
pub async fn test_connection(
    user1: &Identity,
    user2: &Identity,
    sse1: &mut Connection,
    sse2: &mut Connection,
) -> Result<TestResult> {
    println!("{} Waiting for connected events...", "→".blue());

    let mut details = Vec::new();
    let mut passed = true;

    for (identity, connection) in [(user1, &mut *sse1), (user2, &mut *sse2)] {
        match connection.wait_for_event("connected", EVENT_TIMEOUT).await {
            Ok(event) => {
                let user_id = event.data["user_id"].as_str().unwrap_or_default();
                if user_id == identity.user_id {
                    details.push(format!("{} received connected event", connection.user_label));
                } else {
                    passed = false;
                    details.push(format!(
                        "{} connected event carried wrong user id: {}",
                        connection.user_label, user_id
                    ));
                }
            }
            Err(e) => {
                passed = false;
                details.push(format!("{}: {}", connection.user_label, e));
            }
        }
    }

    Ok(if passed {
        TestResult::passed("connection", details)
    } else {
        TestResult::failed("connection", details)
    })
}

/// A targeted event reaches only its addressee; the other connection stays
/// silent. The received event lands in the client cache exactly once even
/// when inserted twice.
pub async fn test_targeted_delivery(
    user1: &Identity,
    user2: &Identity,
    api_client: &ApiClient,
    sse1: &mut Connection,
    sse2: &mut Connection,
) -> Result<TestResult> {
    println!("{} Sending targeted event to user 2...", "→".blue());

    let delivered = api_client
        .send_to_user(
            user1,
            &user2.user_id,
            "notification",
            json!({"msg": "targeted hello"}),
        )
        .await?;

    let mut details = vec![format!("server reported {} local deliveries", delivered)];

    let event = match sse2.wait_for_event("notification", EVENT_TIMEOUT).await {
        Ok(event) => event,
        Err(e) => {
            details.push(format!("{}: {}", sse2.user_label, e));
            return Ok(TestResult::failed("targeted delivery", details));
        }
    };
    if event.data["msg"] != "targeted hello" {
        details.push(format!("unexpected payload: {}", event.data));
        return Ok(TestResult::failed("targeted delivery", details));
    }
    details.push(format!("{} received the event", sse2.user_label));

    if let Err(e) = sse1.expect_no_event("notification", SILENCE_WINDOW).await {
        details.push(e.to_string());
        return Ok(TestResult::failed("targeted delivery", details));
    }
    details.push(format!("{} stayed silent", sse1.user_label));

    // Replayed frames carry the same id; the cache must absorb them.
    let mut cache = EventCache::new(10, chrono::Duration::minutes(30));
    let cached = CachedEvent {
        id: event.id.clone().unwrap_or_default(),
        event_type: event.event_type.clone(),
        data: event.data.clone(),
        received_at: Utc::now(),
    };
    if !cache.insert(cached.clone()) || cache.insert(cached) {
        details.push("cache failed to deduplicate the event id".to_string());
        return Ok(TestResult::failed("targeted delivery", details));
    }
    details.push("client cache deduplicated a replayed frame".to_string());

    Ok(TestResult::passed("targeted delivery", details))
}

/// A broadcast event reaches every live connection.
pub async fn test_broadcast(
    user1: &Identity,
    api_client: &ApiClient,
    sse1: &mut Connection,
    sse2: &mut Connection,
) -> Result<TestResult> {
    println!("{} Broadcasting event to all connections...", "→".blue());

    let delivered = api_client
        .broadcast(user1, "announcement", json!({"msg": "hello everyone"}))
        .await?;

    let mut details = vec![format!("server reported {} local deliveries", delivered)];
    let mut passed = true;

    for connection in [sse1, sse2] {
        match connection.wait_for_event("announcement", EVENT_TIMEOUT).await {
            Ok(event) if event.data["msg"] == "hello everyone" => {
                details.push(format!("{} received the broadcast", connection.user_label));
            }
            Ok(event) => {
                passed = false;
                details.push(format!(
                    "{} received unexpected payload: {}",
                    connection.user_label, event.data
                ));
            }
            Err(e) => {
                passed = false;
                details.push(format!("{}: {}", connection.user_label, e));
            }
        }
    }

    Ok(if passed {
        TestResult::passed("broadcast", details)
    } else {
        TestResult::failed("broadcast", details)
    })
}

/// An event sent to a user with no live connection is queued, then replayed
/// when that user connects: the stream opens with `connected` followed by the
/// queued event.
pub async fn test_offline_replay(
    base_url: &str,
    user1: &Identity,
    offline_user: &Identity,
    api_client: &ApiClient,
) -> Result<TestResult> {
    println!(
        "{} Sending event to disconnected user {}...",
        "→".blue(),
        offline_user.user_id
    );

    let delivered = api_client
        .send_to_user(
            user1,
            &offline_user.user_id,
            "notification",
            json!({"msg": "while you were out"}),
        )
        .await?;

    let mut details = Vec::new();
    if delivered != 0 {
        details.push(format!(
            "expected 0 local deliveries for an offline user, got {}",
            delivered
        ));
        return Ok(TestResult::failed("offline replay", details));
    }
    details.push("event was queued, not delivered".to_string());

    println!("{} Connecting the offline user...", "→".blue());
    let mut connection = Connection::establish(
        base_url,
        offline_user,
        format!("Offline user ({})", offline_user.user_id),
    )
    .await?;

    if let Err(e) = connection.wait_for_event("connected", EVENT_TIMEOUT).await {
        details.push(format!("no connected event after reconnect: {}", e));
        return Ok(TestResult::failed("offline replay", details));
    }

    match connection.wait_for_event("notification", EVENT_TIMEOUT).await {
        Ok(event) if event.data["msg"] == "while you were out" => {
            details.push("queued event was replayed after connect".to_string());
            Ok(TestResult::passed("offline replay", details))
        }
        Ok(event) => {
            details.push(format!("replayed event had wrong payload: {}", event.data));
            Ok(TestResult::failed("offline replay", details))
        }
        Err(e) => {
            details.push(format!("queued event never arrived: {}", e));
            Ok(TestResult::failed("offline replay", details))
        }
    }
}
