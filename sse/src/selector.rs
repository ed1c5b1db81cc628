//! Backend selection and fail-over.
//!
//! Construction of each backend kind sits behind a factory so selection can
//! try them in preference order under a timeout, validate readiness, and
//! fall through to the next kind. The in-process backend closes every
//! preference list, so selection only fails if even that cannot start.

use crate::error::{Error, ErrorKind, Result};
use crate::enhanced_handler::{EnhancedSharedStoreHandler, HistorySettings};
use crate::handler::{EventHandler, HandlerKind};
use crate::local_handler::InProcessHandler;
use crate::metrics::MetricsCollector;
use crate::offline::OfflineQueueSettings;
use crate::redis_handler::SharedStoreHandler;
use futures_util::future::BoxFuture;
use log::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Everything backend construction needs, from configuration.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub preferred: HandlerKind,
    /// Shared-store URL; `None` limits selection to the in-process backend.
    pub redis_url: Option<String>,
    pub init_timeout: Duration,
    pub offline: OfflineQueueSettings,
    pub history: HistorySettings,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            preferred: HandlerKind::EnhancedSharedStore,
            redis_url: None,
            init_timeout: Duration::from_secs(10),
            offline: OfflineQueueSettings::default(),
            history: HistorySettings::default(),
        }
    }
}

type BuildFuture = BoxFuture<'static, Result<Arc<dyn EventHandler>>>;

/// Deferred backend constructor. Kept around after startup so fail-over and
/// explicit switches can rebuild any kind on demand.
pub struct HandlerFactory {
    pub kind: HandlerKind,
    build: Box<dyn Fn() -> BuildFuture + Send + Sync>,
}

impl HandlerFactory {
    pub fn new<F>(kind: HandlerKind, build: F) -> Self
    where
        F: Fn() -> BuildFuture + Send + Sync + 'static,
    {
        Self {
            kind,
            build: Box::new(build),
        }
    }
}

/// Factories for the configured preference order. Shared-store kinds are
/// only offered when a store URL is configured.
pub fn default_factories(
    settings: &BackendSettings,
    metrics: Arc<MetricsCollector>,
) -> Vec<HandlerFactory> {
    HandlerKind::preference_order(settings.preferred)
        .into_iter()
        .filter(|kind| settings.redis_url.is_some() || *kind == HandlerKind::InProcess)
        .map(|kind| {
            let settings = settings.clone();
            let metrics = metrics.clone();
            HandlerFactory::new(kind, move || {
                let settings = settings.clone();
                let metrics = metrics.clone();
                Box::pin(async move { build_handler(kind, &settings, metrics).await })
            })
        })
        .collect()
}

async fn build_handler(
    kind: HandlerKind,
    settings: &BackendSettings,
    metrics: Arc<MetricsCollector>,
) -> Result<Arc<dyn EventHandler>> {
    match kind {
        HandlerKind::InProcess => Ok(Arc::new(InProcessHandler::new(metrics, settings.offline))),
        HandlerKind::SharedStore => {
            let url = require_url(settings)?;
            let handler = SharedStoreHandler::connect(url, metrics, settings.offline).await?;
            Ok(Arc::new(handler))
        }
        HandlerKind::EnhancedSharedStore => {
            let url = require_url(settings)?;
            let handler = EnhancedSharedStoreHandler::connect(
                url,
                metrics,
                settings.offline,
                settings.history,
            )
            .await?;
            Ok(Arc::new(handler))
        }
    }
}

fn require_url(settings: &BackendSettings) -> Result<&str> {
    settings
        .redis_url
        .as_deref()
        .ok_or_else(|| Error::new(ErrorKind::Config))
}

struct ActiveHandler {
    kind: HandlerKind,
    handler: Arc<dyn EventHandler>,
}

pub struct HandlerSelector {
    factories: Vec<HandlerFactory>,
    active: RwLock<Option<ActiveHandler>>,
    init_timeout: Duration,
    metrics: Arc<MetricsCollector>,
}

impl HandlerSelector {
    pub fn new(
        factories: Vec<HandlerFactory>,
        init_timeout: Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            factories,
            active: RwLock::new(None),
            init_timeout,
            metrics,
        }
    }

    /// Tries each factory in order until one produces a ready backend.
    pub async fn start(&self) -> Result<HandlerKind> {
        for factory in &self.factories {
            match self.try_build(factory).await {
                Ok(handler) => {
                    info!("Selected {} delivery backend", factory.kind);
                    *self.active.write().await = Some(ActiveHandler {
                        kind: factory.kind,
                        handler,
                    });
                    return Ok(factory.kind);
                }
                Err(e) => {
                    warn!("Backend {} unavailable: {e}", factory.kind);
                }
            }
        }
        Err(Error::other("no delivery backend could be initialized"))
    }

    async fn try_build(&self, factory: &HandlerFactory) -> Result<Arc<dyn EventHandler>> {
        let handler = match tokio::time::timeout(self.init_timeout, (factory.build)()).await {
            Ok(result) => result?,
            Err(_) => {
                self.metrics
                    .record_error(&ErrorKind::InitializationTimeout);
                return Err(Error::new(ErrorKind::InitializationTimeout));
            }
        };
        if !handler.status().is_ready {
            handler.shutdown().await;
            return Err(Error::other(format!(
                "backend {} built but not ready",
                factory.kind
            )));
        }
        Ok(handler)
    }

    /// The live backend. Errors before `start()` or after `shutdown()`.
    pub async fn active(&self) -> Result<Arc<dyn EventHandler>> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|active| active.handler.clone())
            .ok_or_else(|| Error::other("no active delivery backend"))
    }

    pub async fn active_kind(&self) -> Option<HandlerKind> {
        self.active.read().await.as_ref().map(|active| active.kind)
    }

    /// Replaces the live backend with the requested kind, migrating local
    /// connections across. The old backend keeps serving until the new one
    /// is ready, so a failed switch changes nothing.
    pub async fn switch_to(&self, kind: HandlerKind) -> Result<HandlerKind> {
        let factory = self
            .factories
            .iter()
            .find(|factory| factory.kind == kind)
            .ok_or_else(|| Error::other(format!("backend {kind} is not configured")))?;

        let mut active = self.active.write().await;
        if let Some(current) = active.as_ref() {
            if current.kind == kind {
                return Ok(kind);
            }
        }

        let replacement = self.try_build(factory).await?;
        if let Some(old) = active.take() {
            let exported = old.handler.export_connections();
            info!(
                "Switching backend {} -> {} ({} connection(s) migrating)",
                old.kind,
                kind,
                exported.len()
            );
            replacement.import_connections(exported).await;
            old.handler.shutdown().await;
        }
        *active = Some(ActiveHandler {
            kind,
            handler: replacement,
        });
        Ok(kind)
    }

    /// Falls over to the next configured kind after the current one. Called
    /// when the live backend reports its shared store unusable.
    pub async fn fail_over(&self) -> Result<HandlerKind> {
        let current = self
            .active_kind()
            .await
            .ok_or_else(|| Error::other("no active delivery backend"))?;
        let position = self
            .factories
            .iter()
            .position(|factory| factory.kind == current)
            .unwrap_or(0);

        for factory in &self.factories[position + 1..] {
            match self.switch_to(factory.kind).await {
                Ok(kind) => return Ok(kind),
                Err(e) => warn!("Fail-over to {} failed: {e}", factory.kind),
            }
        }
        Err(Error::other(format!("no backend left to fail over to from {current}")))
    }

    pub async fn shutdown(&self) {
        if let Some(active) = self.active.write().await.take() {
            active.handler.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, ConnectionMetadata};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn metrics() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new(Duration::from_secs(3600)))
    }

    fn in_process_factory(metrics: Arc<MetricsCollector>) -> HandlerFactory {
        HandlerFactory::new(HandlerKind::InProcess, move || {
            let metrics = metrics.clone();
            Box::pin(async move {
                Ok(Arc::new(InProcessHandler::new(
                    metrics,
                    OfflineQueueSettings::default(),
                )) as Arc<dyn EventHandler>)
            })
        })
    }

    fn failing_factory(kind: HandlerKind) -> HandlerFactory {
        HandlerFactory::new(kind, || {
            Box::pin(async { Err(Error::new(ErrorKind::StoreUnavailable)) })
        })
    }

    #[tokio::test]
    async fn test_start_falls_through_to_in_process() {
        let metrics = metrics();
        let selector = HandlerSelector::new(
            vec![
                failing_factory(HandlerKind::EnhancedSharedStore),
                failing_factory(HandlerKind::SharedStore),
                in_process_factory(metrics.clone()),
            ],
            Duration::from_secs(1),
            metrics,
        );

        let kind = selector.start().await.unwrap();
        assert_eq!(kind, HandlerKind::InProcess);
        assert_eq!(selector.active_kind().await, Some(HandlerKind::InProcess));
    }

    #[tokio::test]
    async fn test_active_before_start_errors() {
        let metrics = metrics();
        let selector = HandlerSelector::new(
            vec![in_process_factory(metrics.clone())],
            Duration::from_secs(1),
            metrics,
        );
        assert!(selector.active().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_current_backend() {
        let metrics = metrics();
        let selector = HandlerSelector::new(
            vec![
                failing_factory(HandlerKind::SharedStore),
                in_process_factory(metrics.clone()),
            ],
            Duration::from_secs(1),
            metrics,
        );
        selector.start().await.unwrap();

        assert!(selector.switch_to(HandlerKind::SharedStore).await.is_err());
        assert_eq!(selector.active_kind().await, Some(HandlerKind::InProcess));
        assert!(selector.active().await.is_ok());
    }

    #[tokio::test]
    async fn test_switch_migrates_connections() {
        let metrics = metrics();
        let selector = HandlerSelector::new(
            vec![
                in_process_factory(metrics.clone()),
                // A second in-process factory standing in for another kind.
                HandlerFactory::new(HandlerKind::SharedStore, {
                    let metrics = metrics.clone();
                    move || {
                        let metrics = metrics.clone();
                        Box::pin(async move {
                            Ok(Arc::new(InProcessHandler::new(
                                metrics,
                                OfflineQueueSettings::default(),
                            )) as Arc<dyn EventHandler>)
                        })
                    }
                }),
            ],
            Duration::from_secs(1),
            metrics,
        );
        selector.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = selector.active().await.unwrap();
        handler
            .add_client(
                ConnectionId::new(),
                "u1".to_string(),
                tx,
                ConnectionMetadata::default(),
            )
            .await
            .unwrap();

        selector.switch_to(HandlerKind::SharedStore).await.unwrap();
        let handler = selector.active().await.unwrap();
        let delivered = handler
            .send_to_user(
                &"u1".to_string(),
                events::Event::new("notification", json!({"msg": "survived"})),
                events::SendOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(rx.try_recv().unwrap().contains("survived"));
    }

    #[tokio::test]
    async fn test_fail_over_moves_down_the_order() {
        let metrics = metrics();
        let selector = HandlerSelector::new(
            vec![
                in_process_factory(metrics.clone()),
                HandlerFactory::new(HandlerKind::SharedStore, {
                    let metrics = metrics.clone();
                    move || {
                        let metrics = metrics.clone();
                        Box::pin(async move {
                            Ok(Arc::new(InProcessHandler::new(
                                metrics,
                                OfflineQueueSettings::default(),
                            )) as Arc<dyn EventHandler>)
                        })
                    }
                }),
            ],
            Duration::from_secs(1),
            metrics,
        );
        selector.start().await.unwrap();
        assert_eq!(selector.active_kind().await, Some(HandlerKind::InProcess));

        let kind = selector.fail_over().await.unwrap();
        assert_eq!(kind, HandlerKind::SharedStore);
    }

    #[tokio::test]
    async fn test_fail_over_with_nothing_left_errors() {
        let metrics = metrics();
        let selector = HandlerSelector::new(
            vec![in_process_factory(metrics.clone())],
            Duration::from_secs(1),
            metrics,
        );
        selector.start().await.unwrap();
        assert!(selector.fail_over().await.is_err());
        // The current backend keeps serving.
        assert!(selector.active().await.is_ok());
    }

    #[tokio::test]
    async fn test_default_factories_without_store_url() {
        let settings = BackendSettings::default();
        let factories = default_factories(&settings, metrics());
        assert_eq!(factories.len(), 1);
        assert_eq!(factories[0].kind, HandlerKind::InProcess);
    }

    #[tokio::test]
    async fn test_default_factories_with_store_url() {
        let settings = BackendSettings {
            redis_url: Some("redis://127.0.0.1:6379".to_string()),
            preferred: HandlerKind::SharedStore,
            ..BackendSettings::default()
        };
        let factories = default_factories(&settings, metrics());
        let kinds: Vec<HandlerKind> = factories.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                HandlerKind::SharedStore,
                HandlerKind::EnhancedSharedStore,
                HandlerKind::InProcess
            ]
        );
    }
}
