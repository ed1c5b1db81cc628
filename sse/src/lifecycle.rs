//! Background connection-health maintenance.
//!
//! A single task ticks at the configured interval, asks the live backend to
//! sweep idle and over-age connections, and occasionally (randomly, so a
//! fleet of instances does not stampede the shared store in lockstep) runs
//! the heavier reconcile pass.

use crate::handler::SweepThresholds;
use crate::selector::HandlerSelector;
use log::*;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub sweep_interval: Duration,
    pub thresholds: SweepThresholds,
    /// Chance per tick of also running reconcile, in `0.0..=1.0`.
    pub reconcile_probability: f64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            thresholds: SweepThresholds {
                inactivity_timeout: Duration::from_secs(90),
                max_lifetime: Duration::from_secs(3600),
            },
            reconcile_probability: 0.1,
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: watch::Sender<bool>,
}

impl LifecycleManager {
    pub fn start(selector: Arc<HandlerSelector>, settings: LifecycleSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run(selector, settings, shutdown_rx));
        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run(
    selector: Arc<HandlerSelector>,
    settings: LifecycleSettings,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(settings.sweep_interval);
    // The immediate first tick would sweep an empty registry.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown_rx.changed() => {
                debug!("Lifecycle task stopping");
                return;
            }
        }

        let handler = match selector.active().await {
            Ok(handler) => handler,
            Err(_) => continue,
        };

        let evicted = handler.sweep(settings.thresholds).await;
        if evicted > 0 {
            info!("Lifecycle sweep evicted {evicted} connection(s)");
        }

        if rand::thread_rng().gen_bool(settings.reconcile_probability.clamp(0.0, 1.0)) {
            debug!("Running shared-store reconcile");
            handler.reconcile().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, ConnectionMetadata};
    use crate::handler::HandlerKind;
    use crate::local_handler::InProcessHandler;
    use crate::metrics::MetricsCollector;
    use crate::offline::OfflineQueueSettings;
    use crate::selector::HandlerFactory;

    fn selector() -> Arc<HandlerSelector> {
        let metrics = Arc::new(MetricsCollector::new(Duration::from_secs(3600)));
        let factory = HandlerFactory::new(HandlerKind::InProcess, {
            let metrics = metrics.clone();
            move || {
                let metrics = metrics.clone();
                Box::pin(async move {
                    Ok(Arc::new(InProcessHandler::new(
                        metrics,
                        OfflineQueueSettings::default(),
                    )) as Arc<dyn crate::handler::EventHandler>)
                })
            }
        });
        Arc::new(HandlerSelector::new(
            vec![factory],
            Duration::from_secs(1),
            metrics,
        ))
    }

    #[tokio::test]
    async fn test_sweep_task_evicts_idle_connections() {
        let selector = selector();
        selector.start().await.unwrap();

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
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

        let lifecycle = LifecycleManager::start(
            selector.clone(),
            LifecycleSettings {
                sweep_interval: Duration::from_millis(20),
                thresholds: SweepThresholds {
                    inactivity_timeout: Duration::from_millis(10),
                    max_lifetime: Duration::from_secs(3600),
                },
                reconcile_probability: 0.0,
            },
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(selector.active().await.unwrap().status().local_connections, 0);
        lifecycle.stop();
    }

    #[tokio::test]
    async fn test_stopped_task_sweeps_no_more() {
        let selector = selector();
        selector.start().await.unwrap();

        let lifecycle = LifecycleManager::start(
            selector.clone(),
            LifecycleSettings {
                sweep_interval: Duration::from_millis(10),
                thresholds: SweepThresholds {
                    inactivity_timeout: Duration::from_millis(5),
                    max_lifetime: Duration::from_secs(3600),
                },
                reconcile_probability: 0.0,
            },
        );
        lifecycle.stop();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
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

        tokio::time::sleep(Duration::from_millis(40)).await;
        // Idle past the threshold, but the task is gone.
        assert_eq!(selector.active().await.unwrap().status().local_connections, 1);
    }
}
