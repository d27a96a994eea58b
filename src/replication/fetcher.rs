//! Replication Fetch Loop
//!
//! Long-lived loop driving asynchronous task application, decoupled
//! from the request path that produced the events. Delivery is
//! at-least-once: a task is retried a bounded number of times with a
//! fixed interval before it is quarantined, and one stuck task never
//! blocks progress of other trees or shards beyond its retry budget.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::applier::{ApplyOutcome, ReplicationApplier};
use super::task::ReplicationTask;
use crate::config::ReplicationConfig;
use crate::error::Result;

/// Channel-fed replication apply loop
pub struct ReplicationFetcher {
    applier: Arc<ReplicationApplier>,
    config: ReplicationConfig,
    task_rx: Mutex<mpsc::Receiver<ReplicationTask>>,
    shutdown: RwLock<bool>,
}

impl ReplicationFetcher {
    /// Create a fetcher; the returned sender is the ingestion point for
    /// the replication transport.
    pub fn new(
        applier: Arc<ReplicationApplier>,
        config: ReplicationConfig,
    ) -> (Self, mpsc::Sender<ReplicationTask>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let fetcher = Self {
            applier,
            config,
            task_rx: Mutex::new(rx),
            shutdown: RwLock::new(false),
        };
        (fetcher, tx)
    }

    /// Run the apply loop until shutdown or until every sender is
    /// dropped.
    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            max_attempts = self.config.max_attempts,
            retry_interval_ms = self.config.retry_interval_ms,
            "replication fetcher starting"
        );

        loop {
            if *self.shutdown.read().await {
                break;
            }

            let next = self.task_rx.lock().await.try_recv();
            match next {
                Ok(task) => self.apply_with_retries(task).await,
                Err(TryRecvError::Empty) => {
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }

        tracing::info!("replication fetcher stopped");
        Ok(())
    }

    /// Stop the loop after the in-flight task finishes
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    async fn apply_with_retries(&self, task: ReplicationTask) {
        for attempt in 1..=self.config.max_attempts {
            match self.applier.apply(&task).await {
                Ok(ApplyOutcome::Applied) => {
                    tracing::debug!(task_id = task.task_id(), attempt, "task applied");
                    return;
                }
                Ok(ApplyOutcome::Forked { new_branch }) => {
                    tracing::info!(
                        task_id = task.task_id(),
                        new_branch = %new_branch,
                        "task applied to forked branch"
                    );
                    return;
                }
                Ok(ApplyOutcome::Quarantined) => return,
                Err(err) if err.is_retryable() && attempt < self.config.max_attempts => {
                    tracing::warn!(
                        task_id = task.task_id(),
                        attempt,
                        error = %err,
                        "apply failed, will retry"
                    );
                    tokio::time::sleep(self.config.retry_interval()).await;
                }
                Err(err) => {
                    if let Err(dlq_err) = self.applier.quarantine(&task, &err.to_string()).await {
                        // The DLQ write must not take the loop down; the
                        // source re-delivers at-least-once.
                        tracing::error!(
                            task_id = task.task_id(),
                            error = %dlq_err,
                            "failed to quarantine task"
                        );
                    }
                    return;
                }
            }
        }
    }
}

/// Poll `check` until it reports convergence or `attempts` runs out.
/// Replication application is asynchronous; callers verifying that
/// history has propagated use this instead of assuming synchronous
/// completion.
pub async fn poll_until<F, Fut>(attempts: u32, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..attempts {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::DlqStore;
    use crate::replication::task::{HistoryEvent, HistoryTaskAttributes, VersionHistory, VersionHistoryItem};
    use crate::store::{HistoryNodeStore, HistoryTreeStore, MemoryDriver};
    use chrono::Utc;
    use uuid::Uuid;

    fn fixture() -> (Arc<ReplicationApplier>, Arc<HistoryTreeStore>, Arc<DlqStore>) {
        let driver: Arc<dyn crate::store::HistoryDriver> = Arc::new(MemoryDriver::new(2));
        let nodes = Arc::new(HistoryNodeStore::new(driver.clone()));
        let trees = Arc::new(HistoryTreeStore::new(driver.clone()));
        let dlq = Arc::new(DlqStore::new(driver));
        (
            Arc::new(ReplicationApplier::new(nodes, trees.clone(), dlq.clone())),
            trees,
            dlq,
        )
    }

    fn history_task(tree: Uuid, task_id: i64, first: i64, count: i64) -> ReplicationTask {
        ReplicationTask::History(HistoryTaskAttributes {
            task_id,
            source_cluster: "active".into(),
            shard_id: 0,
            tree_id: tree,
            first_event_id: first,
            next_event_id: first + count,
            version: 1,
            version_history: VersionHistory {
                items: vec![VersionHistoryItem { event_id: first + count - 1, version: 1 }],
            },
            events: (first..first + count)
                .map(|event_id| HistoryEvent {
                    event_id,
                    version: 1,
                    timestamp: Utc::now(),
                    event_type: "Decision".into(),
                    payload: vec![],
                })
                .collect(),
        })
    }

    fn test_config() -> ReplicationConfig {
        ReplicationConfig {
            max_attempts: 3,
            retry_interval_ms: 5,
            poll_interval_ms: 5,
            channel_capacity: 16,
        }
    }

    #[tokio::test]
    async fn test_gap_task_quarantined_then_replayed() {
        let (applier, trees, dlq) = fixture();
        let (fetcher, tx) = ReplicationFetcher::new(applier.clone(), test_config());
        let tree = Uuid::new_v4();

        // The second batch is delivered ahead of the first; its retry
        // budget runs out before the gap can fill and it lands in the
        // DLQ. The first batch then applies normally.
        tx.send(history_task(tree, 2, 4, 2)).await.unwrap();
        tx.send(history_task(tree, 1, 1, 3)).await.unwrap();
        drop(tx);
        fetcher.start().await.unwrap();

        let page = dlq.read_page("active", 0, 0, i64::MAX, 10, &[]).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].task_id, 2);

        // Manual replay: re-drive the quarantined task through the same
        // state machine; the gap is filled now, so it applies.
        let replayed = ReplicationTask::deserialize(&page.entries[0].data).unwrap();
        let outcome = applier.apply(&replayed).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        dlq.purge("active", 0, 2).await.unwrap();
        let page = dlq.read_page("active", 0, 0, i64::MAX, 10, &[]).await.unwrap();
        assert!(page.entries.is_empty());

        let branches = trees.list_branches(0, tree).await.unwrap();
        assert_eq!(branches.len(), 1);
    }

    #[tokio::test]
    async fn test_unfillable_gap_lands_in_dlq() {
        let (applier, _, dlq) = fixture();
        let (fetcher, tx) = ReplicationFetcher::new(applier, test_config());
        let tree = Uuid::new_v4();

        // Events 1..=3 never arrive; the retry budget runs out.
        tx.send(history_task(tree, 5, 4, 2)).await.unwrap();
        drop(tx);
        fetcher.start().await.unwrap();

        let page = dlq.read_page("active", 0, 0, i64::MAX, 10, &[]).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].task_id, 5);
    }

    #[tokio::test]
    async fn test_poll_until_reports_convergence() {
        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let hits_in_check = hits.clone();

        let converged = poll_until(10, Duration::from_millis(1), move || {
            let hits = hits_in_check.clone();
            async move { hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 2 }
        })
        .await;

        assert!(converged);
        assert!(hits.load(std::sync::atomic::Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_poll_until_gives_up() {
        let converged = poll_until(3, Duration::from_millis(1), || async { false }).await;
        assert!(!converged);
    }
}
