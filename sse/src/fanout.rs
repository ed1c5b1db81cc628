//! Cross-instance fan-out bridge.
//!
//! Every outbound event is published to the shared broker tagged with this
//! process's instance id; a subscriber task replays peer-originated
//! messages into local dispatch and discards echoes of our own publishes.
//!
//! Delivery policy is local-first, fan-out best-effort: publish failures are
//! logged and counted but never propagate to the caller, because local
//! delivery has already happened and must not be rolled back. Subscription
//! loss reconnects with capped exponential backoff instead of failing
//! permanently.

use crate::connection::{ConnectionRegistry, DeliveryOutcome};
use crate::error::{ErrorKind, Result};
use crate::metrics::MetricsCollector;
use crate::reliability::ExponentialBackoff;
use crate::wire;
use events::FanoutMessage;
use futures_util::StreamExt;
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Channel every instance subscribes to for broadcasts.
pub const BROADCAST_CHANNEL: &str = "pulse:fanout";
/// Per-user channel namespace; targeted messages go to `pulse:user:<id>`.
pub const USER_CHANNEL_PREFIX: &str = "pulse:user:";

pub(crate) fn channel_for(target_user_id: Option<&str>) -> String {
    match target_user_id {
        Some(user_id) => format!("{USER_CHANNEL_PREFIX}{user_id}"),
        None => BROADCAST_CHANNEL.to_string(),
    }
}

enum FanoutCommand {
    Publish(FanoutMessage),
    Shutdown,
}

/// Handle owned by a shared-store backend. Publishing is fire-and-forget
/// through a command channel; the broker I/O lives in a background task.
pub struct FanoutBridge {
    instance_id: String,
    cmd_tx: mpsc::UnboundedSender<FanoutCommand>,
    connected: Arc<AtomicBool>,
}

impl FanoutBridge {
    /// Opens the broker connection and starts the subscriber task. Fails if
    /// the broker is unreachable right now, so backend initialization can
    /// fall through to the next preference; once started, the task survives
    /// broker outages on its own.
    pub async fn connect(
        redis_url: &str,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        // Reachability probe; the listener task manages its own connections.
        let _probe = client.get_multiplexed_tokio_connection().await?;

        let instance_id = uuid::Uuid::new_v4().to_string();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(listener_task(
            client,
            instance_id.clone(),
            registry,
            metrics,
            cmd_rx,
            connected.clone(),
        ));

        info!("Fan-out bridge started with instance id {instance_id}");
        Ok(Self {
            instance_id,
            cmd_tx,
            connected,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Queues a message for publication. Never fails from the caller's
    /// perspective; a dead listener task is logged.
    pub fn publish(&self, message: FanoutMessage) {
        if self.cmd_tx.send(FanoutCommand::Publish(message)).is_err() {
            warn!("Fan-out listener task is gone; dropping publish");
        }
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(FanoutCommand::Shutdown);
    }
}

/// Replays one raw broker payload into local dispatch. Returns `None` for
/// echoes of our own publishes and for unparseable payloads.
pub(crate) fn handle_incoming(
    instance_id: &str,
    registry: &ConnectionRegistry,
    metrics: &MetricsCollector,
    payload: &str,
) -> Option<DeliveryOutcome> {
    let message: FanoutMessage = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("Discarding unparseable fan-out payload: {e}");
            return None;
        }
    };

    if message.origin_instance_id == instance_id {
        // Echo of our own publish; local delivery already happened.
        return None;
    }

    let frame = match wire::frame_event(&message.event) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Peer event {} failed framing: {e}", message.event.id);
            metrics.record_error(&e.error_kind);
            return None;
        }
    };

    let started = Instant::now();
    let outcome = match &message.target_user_id {
        Some(user_id) => registry.send_to_user(user_id, &frame),
        None => registry.broadcast(&frame),
    };
    metrics.record_event(
        &message.event.event_type,
        message.target_user_id.as_deref(),
    );
    for _ in 0..outcome.failed {
        metrics.record_error(&ErrorKind::TransportWrite);
    }
    metrics.record_latency(started.elapsed());

    debug!(
        "Replayed peer event {} from {} to {} local connection(s)",
        message.event.id, message.origin_instance_id, outcome.delivered
    );
    Some(outcome)
}

/// Outer reconnection loop: runs the broker session until it ends, then
/// backs off and retries. Returns only on shutdown.
async fn listener_task(
    client: redis::Client,
    instance_id: String,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<MetricsCollector>,
    mut cmd_rx: mpsc::UnboundedReceiver<FanoutCommand>,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

    loop {
        match run_session(
            &client,
            &instance_id,
            &registry,
            &metrics,
            &mut cmd_rx,
            &connected,
        )
        .await
        {
            Ok(()) => {
                info!("Fan-out bridge shut down");
                return;
            }
            Err(e) => {
                // A session that got as far as subscribing starts the
                // backoff over; consecutive failed attempts keep growing it.
                if connected.swap(false, Ordering::Relaxed) {
                    backoff.reset();
                }
                metrics.record_error(&ErrorKind::Subscription);
                let delay = backoff.next_delay();
                warn!(
                    "Fan-out subscription lost ({e}); reconnecting in {:.1}s",
                    delay.as_secs_f64()
                );
                if wait_out_backoff(&mut cmd_rx, delay, &metrics).await {
                    return;
                }
            }
        }
    }
}

/// One broker session: a publish connection plus a subscription covering the
/// broadcast channel and the per-user channel pattern.
async fn run_session(
    client: &redis::Client,
    instance_id: &str,
    registry: &ConnectionRegistry,
    metrics: &MetricsCollector,
    cmd_rx: &mut mpsc::UnboundedReceiver<FanoutCommand>,
    connected: &AtomicBool,
) -> std::result::Result<(), String> {
    let mut pub_conn = client
        .get_multiplexed_tokio_connection()
        .await
        .map_err(|e| format!("publish connection failed: {e}"))?;

    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| format!("pubsub connection failed: {e}"))?;
    pubsub
        .subscribe(BROADCAST_CHANNEL)
        .await
        .map_err(|e| format!("subscribe {BROADCAST_CHANNEL} failed: {e}"))?;
    pubsub
        .psubscribe(format!("{USER_CHANNEL_PREFIX}*"))
        .await
        .map_err(|e| format!("psubscribe {USER_CHANNEL_PREFIX}* failed: {e}"))?;

    connected.store(true, Ordering::Relaxed);
    debug!("Fan-out bridge subscribed on {BROADCAST_CHANNEL} and {USER_CHANNEL_PREFIX}*");

    let mut msg_stream = pubsub.into_on_message();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(FanoutCommand::Publish(message)) => {
                    publish_message(&mut pub_conn, message, metrics).await;
                }
                Some(FanoutCommand::Shutdown) | None => return Ok(()),
            },
            incoming = msg_stream.next() => match incoming {
                Some(msg) => {
                    if let Ok(payload) = msg.get_payload::<String>() {
                        handle_incoming(instance_id, registry, metrics, &payload);
                    }
                }
                None => return Err("message stream ended".to_string()),
            },
        }
    }
}

async fn publish_message(
    conn: &mut redis::aio::MultiplexedConnection,
    message: FanoutMessage,
    metrics: &MetricsCollector,
) {
    let channel = channel_for(message.target_user_id.as_deref());
    let payload = match serde_json::to_string(&message) {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to serialize fan-out message {}: {e}", message.id);
            metrics.record_error(&ErrorKind::Publish);
            return;
        }
    };

    // Swallowed on failure: local delivery already succeeded and must not
    // be rolled back by a fan-out problem.
    if let Err(e) = redis::cmd("PUBLISH")
        .arg(&channel)
        .arg(&payload)
        .query_async::<()>(conn)
        .await
    {
        warn!("Fan-out publish to {channel} failed: {e}");
        metrics.record_error(&ErrorKind::Publish);
    }
}

/// Sleeps out a reconnect delay while draining commands so publishers are
/// not blocked. Returns true when shutdown arrived during the wait.
async fn wait_out_backoff(
    cmd_rx: &mut mpsc::UnboundedReceiver<FanoutCommand>,
    delay: Duration,
    metrics: &MetricsCollector,
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(FanoutCommand::Publish(message)) => {
                    warn!("Broker disconnected; dropping fan-out publish {}", message.id);
                    metrics.record_error(&ErrorKind::Publish);
                }
                Some(FanoutCommand::Shutdown) | None => return true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, ConnectionMetadata};
    use events::Event;
    use serde_json::json;

    fn setup() -> (Arc<ConnectionRegistry>, Arc<MetricsCollector>) {
        (
            Arc::new(ConnectionRegistry::new()),
            Arc::new(MetricsCollector::new(Duration::from_secs(3600))),
        )
    }

    fn register_user(
        registry: &ConnectionRegistry,
        user: &str,
    ) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(
            ConnectionId::new(),
            user.to_string(),
            tx,
            ConnectionMetadata::default(),
        );
        rx
    }

    #[test]
    fn test_channel_naming() {
        assert_eq!(channel_for(None), "pulse:fanout");
        assert_eq!(channel_for(Some("u1")), "pulse:user:u1");
    }

    #[test]
    fn test_own_echo_is_discarded() {
        let (registry, metrics) = setup();
        let mut rx = register_user(&registry, "u1");

        let message = FanoutMessage::targeted(
            "instance-a",
            "u1".to_string(),
            Event::new("notification", json!({"msg": "hi"})),
        );
        let payload = serde_json::to_string(&message).unwrap();

        let outcome = handle_incoming("instance-a", &registry, &metrics, &payload);
        assert!(outcome.is_none());
        assert!(rx.try_recv().is_err(), "echo must not be re-delivered");
    }

    #[test]
    fn test_peer_message_is_replayed_to_local_dispatch() {
        let (registry, metrics) = setup();
        let mut rx = register_user(&registry, "u1");

        let message = FanoutMessage::targeted(
            "instance-a",
            "u1".to_string(),
            Event::new("notification", json!({"msg": "hi"})),
        );
        let payload = serde_json::to_string(&message).unwrap();

        let outcome = handle_incoming("instance-b", &registry, &metrics, &payload).unwrap();
        assert_eq!(outcome.delivered, 1);
        let frame = rx.try_recv().unwrap();
        assert!(frame.starts_with("event: notification\n"));
    }

    #[test]
    fn test_peer_broadcast_reaches_all_local_connections() {
        let (registry, metrics) = setup();
        let mut rx_a = register_user(&registry, "u1");
        let mut rx_b = register_user(&registry, "u2");

        let message =
            FanoutMessage::broadcast("instance-a", Event::new("ping", json!({})));
        let payload = serde_json::to_string(&message).unwrap();

        let outcome = handle_incoming("instance-b", &registry, &metrics, &payload).unwrap();
        assert_eq!(outcome.delivered, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_garbage_payload_is_discarded() {
        let (registry, metrics) = setup();
        assert!(handle_incoming("instance-b", &registry, &metrics, "not json").is_none());
    }
}
