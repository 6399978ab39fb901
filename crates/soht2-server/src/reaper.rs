//! Background sweep of abandoned connections

use crate::config::AbandonedConnectionsConfig;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodically closes connections whose client stopped exchanging
pub struct AbandonedConnectionReaper {
    registry: Arc<ConnectionRegistry>,
    timeout: Duration,
    check_interval: Duration,
}

impl AbandonedConnectionReaper {
    pub fn new(registry: Arc<ConnectionRegistry>, config: &AbandonedConnectionsConfig) -> Self {
        Self {
            registry,
            timeout: config.timeout,
            check_interval: config.check_interval,
        }
    }

    pub fn spawn(self) -> ReaperHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.check_interval, self.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(
                "Abandoned connection reaper started (timeout {:?}, interval {:?})",
                self.timeout, self.check_interval
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let closed = self.registry.close_abandoned_connections(self.timeout).await;
                        if closed > 0 {
                            info!("Closed {} abandoned connection(s)", closed);
                        }
                    }
                }
            }

            debug!("Abandoned connection reaper stopped");
        });

        ReaperHandle { shutdown, task }
    }
}

pub struct ReaperHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}
