//! Periodic sync trigger.
//!
//! An owned scheduler instance started and stopped by the composition root —
//! shutdown lets an in-flight pass finish rather than aborting it, so no
//! partially-committed write is ever interrupted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::SyncEngine;

pub struct SyncScheduler {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Start the periodic loop. The first pass runs one full `interval`
    /// after startup, then on every tick; per-mailbox single-flight inside
    /// the engine protects against a pass outliving its interval.
    pub fn spawn(engine: Arc<SyncEngine>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        info!("starting scheduled sync pass");
                        let report = engine.run_cycle().await;
                        info!(
                            mailboxes = report.results.len(),
                            new = report.total_new,
                            sent = report.total_notifications_sent,
                            pruned = report.total_pruned,
                            "scheduled sync pass complete"
                        );
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("sync scheduler stopped");
        });

        Self { shutdown_tx, handle }
    }

    /// Signal the loop to stop and wait for it — an in-flight pass completes
    /// before this returns.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::fetch::{FetchError, FetchedMessage, MailFetcher};
    use crate::notify::{Notifier, NotifyError};
    use crate::storage::{ChannelRow, MailboxRow, MessageRow, Storage};
    use async_trait::async_trait;

    struct NoopFetcher;

    #[async_trait]
    impl MailFetcher for NoopFetcher {
        async fn fetch(
            &self,
            _mailbox: &MailboxRow,
            _with_body: bool,
            _limit: usize,
        ) -> Result<Vec<FetchedMessage>, FetchError> {
            Ok(Vec::new())
        }
    }

    struct NoopNotifier;

    #[async_trait]
    impl Notifier for NoopNotifier {
        async fn send(
            &self,
            _channel: &ChannelRow,
            _message: &MessageRow,
        ) -> Result<(), NotifyError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_promptly() {
        let storage = Arc::new(Storage::new_in_memory().await.unwrap());
        let engine = Arc::new(SyncEngine::new(
            Arc::new(DaemonConfig::default()),
            storage,
            Arc::new(NoopFetcher),
            Arc::new(NoopNotifier),
        ));

        let scheduler = SyncScheduler::spawn(engine, Duration::from_secs(3600));
        // Must return well before the first tick would fire.
        tokio::time::timeout(Duration::from_secs(1), scheduler.shutdown())
            .await
            .expect("shutdown should not wait for the next tick");
    }
}
