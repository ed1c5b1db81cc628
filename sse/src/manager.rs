//! The facade the rest of the platform talks to.
//!
//! Owns backend selection, the shared metrics collector, and the lifecycle
//! task. Callers never see a concrete backend: every operation goes through
//! whatever the selector currently holds, and a shared-store failure during
//! dispatch triggers one fail-over-and-retry before the error surfaces.

use crate::connection::{ConnectionId, ConnectionMetadata, FrameSender};
use crate::error::{ErrorKind, Result};
use crate::handler::{HandlerKind, HandlerStatus};
use crate::lifecycle::{LifecycleManager, LifecycleSettings};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::selector::HandlerSelector;
use events::{Event, SendOptions, UserId};
use log::*;
use std::sync::{Arc, Mutex};

pub struct Manager {
    selector: Arc<HandlerSelector>,
    metrics: Arc<MetricsCollector>,
    lifecycle_settings: LifecycleSettings,
    lifecycle: Mutex<Option<LifecycleManager>>,
}

impl Manager {
    pub fn new(
        selector: Arc<HandlerSelector>,
        metrics: Arc<MetricsCollector>,
        lifecycle_settings: LifecycleSettings,
    ) -> Self {
        Self {
            selector,
            metrics,
            lifecycle_settings,
            lifecycle: Mutex::new(None),
        }
    }

    /// Selects the initial backend and starts connection-health maintenance.
    pub async fn start(&self) -> Result<HandlerKind> {
        let kind = self.selector.start().await?;
        let lifecycle =
            LifecycleManager::start(self.selector.clone(), self.lifecycle_settings);
        *self.lifecycle.lock().unwrap() = Some(lifecycle);
        info!("Event distribution started on the {kind} backend");
        Ok(kind)
    }

    pub async fn shutdown(&self) {
        if let Some(lifecycle) = self.lifecycle.lock().unwrap().take() {
            lifecycle.stop();
        }
        self.selector.shutdown().await;
        info!("Event distribution stopped");
    }

    pub async fn add_client(
        &self,
        id: ConnectionId,
        user_id: UserId,
        sender: FrameSender,
        metadata: ConnectionMetadata,
    ) -> Result<()> {
        let handler = self.selector.active().await?;
        handler.add_client(id, user_id, sender, metadata).await
    }

    pub async fn remove_client(&self, id: &ConnectionId) {
        if let Ok(handler) = self.selector.active().await {
            handler.remove_client(id).await;
        }
    }

    /// Delivers to one user's connections, everywhere in the fleet. Returns
    /// the local delivery count; 0 means queued or delivered elsewhere.
    pub async fn send_event_to_user(
        &self,
        user_id: &UserId,
        event: Event,
        options: SendOptions,
    ) -> Result<usize> {
        let handler = self.selector.active().await?;
        match handler.send_to_user(user_id, event.clone(), options).await {
            Err(e) if e.error_kind == ErrorKind::StoreUnavailable => {
                warn!("Shared store unusable during dispatch ({e}); failing over");
                self.selector.fail_over().await?;
                let handler = self.selector.active().await?;
                handler.send_to_user(user_id, event, options).await
            }
            result => result,
        }
    }

    /// Delivers to every connection in the fleet.
    pub async fn broadcast_event(&self, event: Event, options: SendOptions) -> Result<usize> {
        let handler = self.selector.active().await?;
        match handler.broadcast(event.clone(), options).await {
            Err(e) if e.error_kind == ErrorKind::StoreUnavailable => {
                warn!("Shared store unusable during broadcast ({e}); failing over");
                self.selector.fail_over().await?;
                let handler = self.selector.active().await?;
                handler.broadcast(event, options).await
            }
            result => result,
        }
    }

    pub async fn update_client_activity(&self, id: &ConnectionId) {
        if let Ok(handler) = self.selector.active().await {
            handler.update_activity(id).await;
        }
    }

    pub async fn status(&self) -> Result<HandlerStatus> {
        Ok(self.selector.active().await?.status())
    }

    pub fn stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn active_kind(&self) -> Option<HandlerKind> {
        self.selector.active_kind().await
    }

    /// Operator-requested backend switch; migrates live connections.
    pub async fn switch_handler(&self, kind: HandlerKind) -> Result<HandlerKind> {
        self.selector.switch_to(kind).await
    }
}
