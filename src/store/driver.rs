//! Storage Driver Contract
//!
//! The relational executor seam: parameterized insert/select/delete
//! against the three logical tables, scoped per storage shard. The core
//! is agnostic to the engine behind this trait; [`super::MySqlDriver`]
//! backs production and [`super::MemoryDriver`] backs tests and
//! embedding.
//!
//! All ordered reads return rows in `(shard_id, tree_id, branch_id,
//! node_id, txn_id)` ascending order *as stored*; fencing-token sign
//! handling is the node store's concern, not the driver's.

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    BranchScanPosition, DlqRow, HistoryBranchRow, HistoryNodeRow, NodeDeleteFilter,
    NodeRangeFilter,
};
use crate::error::Result;

/// Driver over the history_node, history_tree, and replication DLQ
/// tables of one deployment.
#[async_trait]
pub trait HistoryDriver: Send + Sync {
    /// Number of physical storage shards this driver spans
    fn total_shards(&self) -> u32;

    // ---- history_node ----

    /// Insert one node row. Fails with `ConstraintViolation` if the
    /// primary key `(shard_id, tree_id, branch_id, node_id, txn_id)`
    /// already exists.
    ///
    /// Drivers are only required to detect exact-duplicate tokens; the
    /// MySQL driver relies on the primary key alone and accepts a
    /// smaller (stale) token as a distinct row. [`super::MemoryDriver`]
    /// additionally rejects any non-greater token. Callers needing the
    /// strict-greater guarantee across drivers must issue monotonically
    /// increasing tokens, as `HistoryNodeStore::append` callers do.
    async fn insert_node(&self, storage_shard: u32, row: HistoryNodeRow) -> Result<()>;

    /// Select node rows matching the range filter, ordered ascending,
    /// at most `page_size` rows.
    async fn select_nodes(
        &self,
        storage_shard: u32,
        filter: &NodeRangeFilter,
    ) -> Result<Vec<HistoryNodeRow>>;

    /// Delete up to `page_size` node rows with `node_id >= min_node_id`,
    /// returning the number removed.
    async fn delete_nodes(&self, storage_shard: u32, filter: &NodeDeleteFilter) -> Result<u64>;

    // ---- history_tree ----

    /// Insert one branch row. Fails with `DuplicateBranch` if the branch
    /// already exists.
    async fn insert_branch(&self, storage_shard: u32, row: HistoryBranchRow) -> Result<()>;

    /// Select all branch rows of one tree
    async fn select_branches(
        &self,
        storage_shard: u32,
        shard_id: i32,
        tree_id: Uuid,
    ) -> Result<Vec<HistoryBranchRow>>;

    /// Delete exactly one branch row, returning the number removed
    /// (0 or 1). Does not cascade to node rows.
    async fn delete_branch(
        &self,
        storage_shard: u32,
        shard_id: i32,
        tree_id: Uuid,
        branch_id: Uuid,
    ) -> Result<u64>;

    /// Scan branch rows strictly after `after` within one storage shard,
    /// ordered by `(shard_id, tree_id, branch_id)`, at most `page_size`
    /// rows.
    async fn scan_branches(
        &self,
        storage_shard: u32,
        after: &BranchScanPosition,
        page_size: usize,
    ) -> Result<Vec<HistoryBranchRow>>;

    // ---- replication DLQ ----

    /// Insert one DLQ row
    async fn insert_dlq(&self, storage_shard: u32, row: DlqRow) -> Result<()>;

    /// Select DLQ rows for `(source_cluster, shard_id)` with `task_id`
    /// in `[min_task_id, max_task_id)`, ordered by task id, at most
    /// `page_size` rows.
    async fn select_dlq(
        &self,
        storage_shard: u32,
        source_cluster: &str,
        shard_id: i32,
        min_task_id: i64,
        max_task_id: i64,
        page_size: usize,
    ) -> Result<Vec<DlqRow>>;

    /// Delete DLQ rows for `(source_cluster, shard_id)` with
    /// `task_id <= upto_task_id`, returning the number removed.
    async fn delete_dlq(
        &self,
        storage_shard: u32,
        source_cluster: &str,
        shard_id: i32,
        upto_task_id: i64,
    ) -> Result<u64>;
}
