//! History Node Store
//!
//! Ordered event-batch records per branch: append, ranged read, ranged
//! delete. Routes every call to the tree's storage shard.
//!
//! The backing store has no descending-order index, so the fencing
//! token is persisted negated: the native ascending index then yields
//! the most recent write first within a node. The negation is applied
//! on the way in and reverted on the way out of this module; drivers
//! only ever see the stored form.

use std::sync::Arc;

use super::driver::HistoryDriver;
use super::{HistoryNodeRow, NodeDeleteFilter, NodeRangeFilter};
use crate::error::{Error, Result};
use crate::shard;

/// Store for history_node records
pub struct HistoryNodeStore {
    driver: Arc<dyn HistoryDriver>,
}

impl HistoryNodeStore {
    /// Create a node store over a driver
    pub fn new(driver: Arc<dyn HistoryDriver>) -> Self {
        Self { driver }
    }

    /// Append one node record.
    ///
    /// Fails with `ConstraintViolation` when the fencing token is not
    /// strictly greater than every prior write to the same
    /// `(tree, branch, node)`; the caller must re-validate, not retry.
    pub async fn append(&self, mut row: HistoryNodeRow) -> Result<()> {
        if row.txn_id <= 0 {
            return Err(Error::Internal(format!(
                "fencing token must be positive, got {}",
                row.txn_id
            )));
        }

        let storage_shard = shard::route(row.tree_id, self.driver.total_shards());
        tracing::debug!(
            tree_id = %row.tree_id,
            branch_id = %row.branch_id,
            node_id = row.node_id,
            txn_id = row.txn_id,
            storage_shard,
            "appending history node"
        );

        row.txn_id = -row.txn_id;
        self.driver.insert_node(storage_shard, row).await
    }

    /// Read records with `node_id` in `[min_node_id, max_node_id)`,
    /// ordered by `(node_id, txn_id)` ascending in stored form, so
    /// within one node the most recent write comes first. Fencing tokens are
    /// returned in true form.
    pub async fn read_range(&self, filter: NodeRangeFilter) -> Result<Vec<HistoryNodeRow>> {
        let storage_shard = shard::route(filter.tree_id, self.driver.total_shards());
        let mut rows = self.driver.select_nodes(storage_shard, &filter).await?;
        for row in &mut rows {
            row.txn_id = -row.txn_id;
        }
        Ok(rows)
    }

    /// Delete up to `page_size` records with `node_id >= min_node_id`,
    /// returning the count removed. Callers loop until 0 to truncate a
    /// branch completely.
    pub async fn delete_range(&self, filter: NodeDeleteFilter) -> Result<u64> {
        let storage_shard = shard::route(filter.tree_id, self.driver.total_shards());
        let removed = self.driver.delete_nodes(storage_shard, &filter).await?;
        tracing::debug!(
            tree_id = %filter.tree_id,
            branch_id = %filter.branch_id,
            min_node_id = filter.min_node_id,
            removed,
            "deleted history nodes"
        );
        Ok(removed)
    }
}
