//! Replication Dead-Letter Queue
//!
//! Durable sink for replication tasks that could not be applied.
//! Entries are owned by the `(source_cluster, shard_id)` pair that
//! failed to apply them; draining is paginated with a caller-held
//! continuation token so multiple pairs drain concurrently without
//! cursor interference.

use std::sync::Arc;

use crate::error::Result;
use crate::store::driver::HistoryDriver;
use crate::store::{DlqRow, Encoding};
use crate::replication::task::ReplicationTask;

/// One page of DLQ entries. `next_token` is empty once the range is
/// exhausted; callers loop until then rather than assuming a single
/// page is complete.
#[derive(Debug, Clone)]
pub struct DlqPage {
    pub entries: Vec<DlqRow>,
    pub next_token: Vec<u8>,
}

/// Store for quarantined replication tasks
pub struct DlqStore {
    driver: Arc<dyn HistoryDriver>,
}

impl DlqStore {
    /// Create a DLQ store over a driver
    pub fn new(driver: Arc<dyn HistoryDriver>) -> Self {
        Self { driver }
    }

    /// DLQ rows are not tree-keyed; they ride on the logical shard.
    fn storage_shard(&self, shard_id: i32) -> u32 {
        shard_id.unsigned_abs() % self.driver.total_shards()
    }

    /// Durably record a task that could not be applied. Issued as its
    /// own store call, never inside the failed apply's transaction, so
    /// quarantine succeeds independently of the failure that caused it.
    pub async fn enqueue(&self, task: &ReplicationTask) -> Result<()> {
        let row = DlqRow {
            source_cluster: task.source_cluster().to_string(),
            shard_id: task.shard_id(),
            task_id: task.task_id(),
            data: task.serialize()?,
            data_encoding: Encoding::Bincode,
        };

        tracing::warn!(
            source_cluster = %row.source_cluster,
            shard_id = row.shard_id,
            task_id = row.task_id,
            kind = task.type_name(),
            "task quarantined to DLQ"
        );

        let storage_shard = self.storage_shard(row.shard_id);
        self.driver.insert_dlq(storage_shard, row).await
    }

    /// Read one page of entries with `task_id` in
    /// `[min_task_id, max_task_id)`, resuming from `token` when given.
    pub async fn read_page(
        &self,
        source_cluster: &str,
        shard_id: i32,
        min_task_id: i64,
        max_task_id: i64,
        page_size: usize,
        token: &[u8],
    ) -> Result<DlqPage> {
        // A zero-row page can never drain the range; report it as
        // exhausted so the loop-until-empty contract terminates.
        if page_size == 0 {
            return Ok(DlqPage { entries: Vec::new(), next_token: Vec::new() });
        }

        let min = if token.is_empty() {
            min_task_id
        } else {
            let last: i64 = bincode::deserialize(token)?;
            last + 1
        };

        let entries = self
            .driver
            .select_dlq(
                self.storage_shard(shard_id),
                source_cluster,
                shard_id,
                min,
                max_task_id,
                page_size,
            )
            .await?;

        // A full page may have more behind it; a short page is the end.
        let next_token = if entries.len() == page_size {
            bincode::serialize(&entries.last().map(|e| e.task_id).unwrap_or(min))?
        } else {
            Vec::new()
        };

        Ok(DlqPage { entries, next_token })
    }

    /// Delete entries with `task_id <= upto_task_id`, used after a
    /// successful manual replay. Returns the count removed.
    pub async fn purge(
        &self,
        source_cluster: &str,
        shard_id: i32,
        upto_task_id: i64,
    ) -> Result<u64> {
        let removed = self
            .driver
            .delete_dlq(
                self.storage_shard(shard_id),
                source_cluster,
                shard_id,
                upto_task_id,
            )
            .await?;
        tracing::info!(
            source_cluster,
            shard_id,
            upto_task_id,
            removed,
            "purged DLQ entries"
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::task::{HistoryTaskAttributes, VersionHistory};
    use crate::store::MemoryDriver;

    fn task(shard_id: i32, task_id: i64) -> ReplicationTask {
        ReplicationTask::History(HistoryTaskAttributes {
            task_id,
            source_cluster: "standby".into(),
            shard_id,
            tree_id: uuid::Uuid::new_v4(),
            first_event_id: task_id,
            next_event_id: task_id + 1,
            version: 1,
            version_history: VersionHistory::new(),
            events: vec![],
        })
    }

    #[tokio::test]
    async fn test_paging_yields_all_entries_once() {
        let store = DlqStore::new(Arc::new(MemoryDriver::new(2)));

        for task_id in 1..=7 {
            store.enqueue(&task(0, task_id)).await.unwrap();
        }

        // Every page size from 1..=7 must yield exactly the 7 entries.
        for page_size in 1..=7usize {
            let mut seen = Vec::new();
            let mut token = Vec::new();
            loop {
                let page = store
                    .read_page("standby", 0, 0, i64::MAX, page_size, &token)
                    .await
                    .unwrap();
                seen.extend(page.entries.iter().map(|e| e.task_id));
                if page.next_token.is_empty() {
                    break;
                }
                token = page.next_token;
            }
            assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7], "page_size {}", page_size);
        }
    }

    #[tokio::test]
    async fn test_zero_page_size_terminates() {
        let store = DlqStore::new(Arc::new(MemoryDriver::new(2)));
        store.enqueue(&task(0, 1)).await.unwrap();

        let page = store
            .read_page("standby", 0, 0, i64::MAX, 0, &[])
            .await
            .unwrap();
        assert!(page.entries.is_empty());
        assert!(page.next_token.is_empty());
    }

    #[tokio::test]
    async fn test_pairs_do_not_interfere() {
        let store = DlqStore::new(Arc::new(MemoryDriver::new(2)));

        store.enqueue(&task(0, 1)).await.unwrap();
        store.enqueue(&task(1, 2)).await.unwrap();

        let page = store
            .read_page("standby", 0, 0, i64::MAX, 10, &[])
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].task_id, 1);
    }

    #[tokio::test]
    async fn test_purge_upto_watermark() {
        let store = DlqStore::new(Arc::new(MemoryDriver::new(2)));

        for task_id in 1..=5 {
            store.enqueue(&task(0, task_id)).await.unwrap();
        }

        let removed = store.purge("standby", 0, 3).await.unwrap();
        assert_eq!(removed, 3);

        let page = store
            .read_page("standby", 0, 0, i64::MAX, 10, &[])
            .await
            .unwrap();
        let remaining: Vec<i64> = page.entries.iter().map(|e| e.task_id).collect();
        assert_eq!(remaining, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_entries_round_trip_through_serialization() {
        let store = DlqStore::new(Arc::new(MemoryDriver::new(2)));
        let original = task(0, 9);

        store.enqueue(&original).await.unwrap();

        let page = store
            .read_page("standby", 0, 0, i64::MAX, 10, &[])
            .await
            .unwrap();
        let restored = ReplicationTask::deserialize(&page.entries[0].data).unwrap();
        assert_eq!(restored, original);
    }
}
