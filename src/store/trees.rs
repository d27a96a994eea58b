//! History Tree Store
//!
//! Branch metadata per tree: creation, listing, deletion, and a global
//! keyset-paginated scan for maintenance jobs. The tree shape is never
//! held in memory; it is reconstructed on demand from `list_branches`.

use std::sync::Arc;

use uuid::Uuid;

use super::driver::HistoryDriver;
use super::{BranchScanPosition, HistoryBranchRow};
use crate::error::{Error, Result};
use crate::shard;

/// One page of the global branch scan
#[derive(Debug, Clone)]
pub struct BranchPage {
    pub branches: Vec<HistoryBranchRow>,
    /// Position to resume from; `None` when the scan is complete
    pub next: Option<BranchScanPosition>,
}

/// Store for history_tree records
pub struct HistoryTreeStore {
    driver: Arc<dyn HistoryDriver>,
}

impl HistoryTreeStore {
    /// Create a tree store over a driver
    pub fn new(driver: Arc<dyn HistoryDriver>) -> Self {
        Self { driver }
    }

    /// Insert branch metadata. Fails with `DuplicateBranch` if the
    /// branch already exists in the tree.
    pub async fn create_branch(&self, row: HistoryBranchRow) -> Result<()> {
        let storage_shard = shard::route(row.tree_id, self.driver.total_shards());
        tracing::debug!(
            tree_id = %row.tree_id,
            branch_id = %row.branch_id,
            storage_shard,
            "creating history branch"
        );
        self.driver.insert_branch(storage_shard, row).await
    }

    /// Return all branch records of one tree
    pub async fn list_branches(&self, shard_id: i32, tree_id: Uuid) -> Result<Vec<HistoryBranchRow>> {
        let storage_shard = shard::route(tree_id, self.driver.total_shards());
        self.driver
            .select_branches(storage_shard, shard_id, tree_id)
            .await
    }

    /// Remove exactly one branch's metadata. Does not cascade to the
    /// branch's node rows; the caller truncates those first via
    /// `HistoryNodeStore::delete_range`.
    pub async fn delete_branch(&self, shard_id: i32, tree_id: Uuid, branch_id: Uuid) -> Result<()> {
        let storage_shard = shard::route(tree_id, self.driver.total_shards());
        let removed = self
            .driver
            .delete_branch(storage_shard, shard_id, tree_id, branch_id)
            .await?;
        if removed == 0 {
            return Err(Error::UnknownBranch { tree_id, branch_id });
        }
        Ok(())
    }

    /// Globally ordered scan across all trees and storage shards,
    /// resuming strictly after `after`. Keyset pagination; no offset
    /// scans.
    pub async fn enumerate_all(
        &self,
        after: BranchScanPosition,
        page_size: usize,
    ) -> Result<BranchPage> {
        let total = self.driver.total_shards();
        let mut branches = Vec::with_capacity(page_size);
        let mut storage_shard = after.storage_shard;
        let mut pos = after;

        while storage_shard < total && branches.len() < page_size {
            let need = page_size - branches.len();
            let rows = self.driver.scan_branches(storage_shard, &pos, need).await?;
            let drained = rows.len() < need;

            if let Some(last) = rows.last() {
                pos = BranchScanPosition {
                    storage_shard,
                    shard_id: last.shard_id,
                    tree_id: last.tree_id,
                    branch_id: last.branch_id,
                };
            }
            branches.extend(rows);

            if drained {
                storage_shard += 1;
                pos = BranchScanPosition {
                    storage_shard,
                    ..BranchScanPosition::start()
                };
            }
        }

        let next = (branches.len() == page_size && storage_shard < total).then_some(pos);
        Ok(BranchPage { branches, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BranchAncestry, Encoding, MemoryDriver};

    fn store() -> HistoryTreeStore {
        HistoryTreeStore::new(Arc::new(MemoryDriver::new(4)))
    }

    fn branch(tree: Uuid, branch_id: Uuid) -> HistoryBranchRow {
        let (data, data_encoding) = BranchAncestry::root().encode().unwrap();
        HistoryBranchRow {
            shard_id: 0,
            tree_id: tree,
            branch_id,
            data,
            data_encoding,
        }
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let store = store();
        let tree = Uuid::new_v4();
        let b1 = Uuid::new_v4();
        let b2 = Uuid::new_v4();

        store.create_branch(branch(tree, b1)).await.unwrap();
        store.create_branch(branch(tree, b2)).await.unwrap();

        let rows = store.list_branches(0, tree).await.unwrap();
        assert_eq!(rows.len(), 2);

        // Ancestry blob decodes back
        let ancestry = BranchAncestry::decode(&rows[0].data, rows[0].data_encoding).unwrap();
        assert!(ancestry.ancestors.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_branch_rejected() {
        let store = store();
        let tree = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.create_branch(branch(tree, b)).await.unwrap();
        let err = store.create_branch(branch(tree, b)).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateBranch { .. }));
    }

    #[tokio::test]
    async fn test_delete_is_branch_isolated() {
        let store = store();
        let tree = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        store.create_branch(branch(tree, b)).await.unwrap();
        store.create_branch(branch(tree, c)).await.unwrap();

        store.delete_branch(0, tree, b).await.unwrap();

        let rows = store.list_branches(0, tree).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].branch_id, c);
    }

    #[tokio::test]
    async fn test_delete_unknown_branch() {
        let store = store();
        let tree = Uuid::new_v4();

        let err = store.delete_branch(0, tree, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownBranch { .. }));
    }

    #[tokio::test]
    async fn test_enumerate_all_spans_storage_shards() {
        let store = store();

        // 20 single-branch trees spread across the 4 storage shards
        let mut expected = std::collections::HashSet::new();
        for _ in 0..20 {
            let tree = Uuid::new_v4();
            let b = Uuid::new_v4();
            store.create_branch(branch(tree, b)).await.unwrap();
            expected.insert(b);
        }

        let mut seen = std::collections::HashSet::new();
        let mut after = BranchScanPosition::start();
        loop {
            let page = store.enumerate_all(after, 3).await.unwrap();
            for row in &page.branches {
                assert!(seen.insert(row.branch_id), "duplicate branch in scan");
            }
            match page.next {
                Some(next) => after = next,
                None => break,
            }
        }

        assert_eq!(seen, expected);
    }
}
