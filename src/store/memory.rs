//! In-Memory Driver
//!
//! A full [`HistoryDriver`] over `BTreeMap`s keyed by the same ordering
//! tuples the SQL indexes use, so range and ordering semantics match the
//! MySQL driver exactly. Used by the test suites and by embedders that
//! need the storage semantics without a database.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::driver::HistoryDriver;
use super::{
    BranchScanPosition, DlqRow, HistoryBranchRow, HistoryNodeRow, NodeDeleteFilter,
    NodeRangeFilter,
};
use crate::error::{Error, Result};

/// Node-table key: `(shard_id, tree_id, branch_id, node_id, stored_txn_id)`
type NodeKey = (i32, Uuid, Uuid, i64, i64);

/// Tree-table key: `(shard_id, tree_id, branch_id)`
type BranchKey = (i32, Uuid, Uuid);

/// DLQ key: `(source_cluster, shard_id, task_id)`
type DlqKey = (String, i32, i64);

#[derive(Default)]
struct ShardData {
    nodes: BTreeMap<NodeKey, HistoryNodeRow>,
    branches: BTreeMap<BranchKey, HistoryBranchRow>,
    dlq: BTreeMap<DlqKey, DlqRow>,
}

/// In-memory history driver
pub struct MemoryDriver {
    shards: Vec<RwLock<ShardData>>,
}

impl MemoryDriver {
    /// Create a driver spanning `total_shards` storage shards
    pub fn new(total_shards: u32) -> Self {
        Self {
            shards: (0..total_shards).map(|_| RwLock::default()).collect(),
        }
    }

    fn shard(&self, storage_shard: u32) -> Result<&RwLock<ShardData>> {
        self.shards
            .get(storage_shard as usize)
            .ok_or_else(|| Error::Internal(format!("storage shard {} out of range", storage_shard)))
    }
}

#[async_trait]
impl HistoryDriver for MemoryDriver {
    fn total_shards(&self) -> u32 {
        self.shards.len() as u32
    }

    async fn insert_node(&self, storage_shard: u32, row: HistoryNodeRow) -> Result<()> {
        let mut data = self.shard(storage_shard)?.write().await;

        // txn ids arrive negated; a stored token <= the new one means the
        // true token is not strictly greater than an existing write.
        let lo: NodeKey = (row.shard_id, row.tree_id, row.branch_id, row.node_id, i64::MIN);
        let hi: NodeKey = (row.shard_id, row.tree_id, row.branch_id, row.node_id, i64::MAX);
        let stale = data
            .nodes
            .range((Bound::Included(lo), Bound::Included(hi)))
            .any(|(key, _)| key.4 <= row.txn_id);
        if stale {
            return Err(Error::ConstraintViolation {
                tree_id: row.tree_id,
                branch_id: row.branch_id,
                node_id: row.node_id,
            });
        }

        let key: NodeKey = (row.shard_id, row.tree_id, row.branch_id, row.node_id, row.txn_id);
        data.nodes.insert(key, row);
        Ok(())
    }

    async fn select_nodes(
        &self,
        storage_shard: u32,
        filter: &NodeRangeFilter,
    ) -> Result<Vec<HistoryNodeRow>> {
        let data = self.shard(storage_shard)?.read().await;

        let lo: NodeKey = (
            filter.shard_id,
            filter.tree_id,
            filter.branch_id,
            filter.min_node_id,
            i64::MIN,
        );
        let hi: NodeKey = (
            filter.shard_id,
            filter.tree_id,
            filter.branch_id,
            filter.max_node_id,
            i64::MIN,
        );

        Ok(data
            .nodes
            .range((Bound::Included(lo), Bound::Excluded(hi)))
            .take(filter.page_size)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn delete_nodes(&self, storage_shard: u32, filter: &NodeDeleteFilter) -> Result<u64> {
        let mut data = self.shard(storage_shard)?.write().await;

        let lo: NodeKey = (
            filter.shard_id,
            filter.tree_id,
            filter.branch_id,
            filter.min_node_id,
            i64::MIN,
        );
        let hi: NodeKey = (
            filter.shard_id,
            filter.tree_id,
            filter.branch_id,
            i64::MAX,
            i64::MAX,
        );

        let keys: Vec<NodeKey> = data
            .nodes
            .range((Bound::Included(lo), Bound::Included(hi)))
            .take(filter.page_size)
            .map(|(key, _)| *key)
            .collect();

        for key in &keys {
            data.nodes.remove(key);
        }
        Ok(keys.len() as u64)
    }

    async fn insert_branch(&self, storage_shard: u32, row: HistoryBranchRow) -> Result<()> {
        let mut data = self.shard(storage_shard)?.write().await;

        let key: BranchKey = (row.shard_id, row.tree_id, row.branch_id);
        if data.branches.contains_key(&key) {
            return Err(Error::DuplicateBranch {
                tree_id: row.tree_id,
                branch_id: row.branch_id,
            });
        }
        data.branches.insert(key, row);
        Ok(())
    }

    async fn select_branches(
        &self,
        storage_shard: u32,
        shard_id: i32,
        tree_id: Uuid,
    ) -> Result<Vec<HistoryBranchRow>> {
        let data = self.shard(storage_shard)?.read().await;

        let lo: BranchKey = (shard_id, tree_id, Uuid::nil());
        let hi: BranchKey = (shard_id, tree_id, Uuid::from_u128(u128::MAX));

        Ok(data
            .branches
            .range((Bound::Included(lo), Bound::Included(hi)))
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn delete_branch(
        &self,
        storage_shard: u32,
        shard_id: i32,
        tree_id: Uuid,
        branch_id: Uuid,
    ) -> Result<u64> {
        let mut data = self.shard(storage_shard)?.write().await;
        let removed = data.branches.remove(&(shard_id, tree_id, branch_id));
        Ok(u64::from(removed.is_some()))
    }

    async fn scan_branches(
        &self,
        storage_shard: u32,
        after: &BranchScanPosition,
        page_size: usize,
    ) -> Result<Vec<HistoryBranchRow>> {
        let data = self.shard(storage_shard)?.read().await;

        let lo: BranchKey = (after.shard_id, after.tree_id, after.branch_id);
        Ok(data
            .branches
            .range((Bound::Excluded(lo), Bound::Unbounded))
            .take(page_size)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn insert_dlq(&self, storage_shard: u32, row: DlqRow) -> Result<()> {
        let mut data = self.shard(storage_shard)?.write().await;

        // Re-quarantining the same delivery is an upsert: at-least-once
        // delivery may quarantine one task twice.
        let key: DlqKey = (row.source_cluster.clone(), row.shard_id, row.task_id);
        data.dlq.insert(key, row);
        Ok(())
    }

    async fn select_dlq(
        &self,
        storage_shard: u32,
        source_cluster: &str,
        shard_id: i32,
        min_task_id: i64,
        max_task_id: i64,
        page_size: usize,
    ) -> Result<Vec<DlqRow>> {
        let data = self.shard(storage_shard)?.read().await;

        let lo: DlqKey = (source_cluster.to_string(), shard_id, min_task_id);
        let hi: DlqKey = (source_cluster.to_string(), shard_id, max_task_id);

        Ok(data
            .dlq
            .range((Bound::Included(lo), Bound::Excluded(hi)))
            .take(page_size)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn delete_dlq(
        &self,
        storage_shard: u32,
        source_cluster: &str,
        shard_id: i32,
        upto_task_id: i64,
    ) -> Result<u64> {
        let mut data = self.shard(storage_shard)?.write().await;

        let lo: DlqKey = (source_cluster.to_string(), shard_id, i64::MIN);
        let hi: DlqKey = (source_cluster.to_string(), shard_id, upto_task_id);

        let keys: Vec<DlqKey> = data
            .dlq
            .range((Bound::Included(lo), Bound::Included(hi)))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            data.dlq.remove(key);
        }
        Ok(keys.len() as u64)
    }
}
