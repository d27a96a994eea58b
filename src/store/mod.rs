//! History Storage
//!
//! Branching history storage: every workflow run is one *tree* of
//! *branches*, each branch an ordered sequence of *nodes* (event
//! batches). Rows are partitioned across physical storage shards by
//! [`crate::shard::route`]; all rows of one tree share a shard.

pub mod driver;
pub mod memory;
pub mod mysql;
pub mod nodes;
pub mod trees;

pub use driver::HistoryDriver;
pub use memory::MemoryDriver;
pub use mysql::MySqlDriver;
pub use nodes::HistoryNodeStore;
pub use trees::{BranchPage, HistoryTreeStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Identifies one workflow run's entire history tree
pub type TreeId = Uuid;

/// Identifies one branch within a tree
pub type BranchId = Uuid;

/// Encoding of a persisted blob, stored alongside the data so readers
/// can decode rows written by older deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    Bincode,
}

impl Encoding {
    /// Column representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Bincode => "bincode",
        }
    }

    /// Parse the column representation
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "bincode" => Ok(Encoding::Bincode),
            other => Err(Error::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// One stored batch of history events at a logical position in a branch.
///
/// `txn_id` is the write-ordering fencing token. Callers always observe
/// it in its true ascending form; [`HistoryNodeStore`] negates it for
/// storage and reverts it on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryNodeRow {
    /// Logical shard owning the workflow run (assigned externally)
    pub shard_id: i32,
    pub tree_id: TreeId,
    pub branch_id: BranchId,
    /// Logical position within the branch; monotonically increasing
    pub node_id: i64,
    /// Fencing token; most recent write wins
    pub txn_id: i64,
    pub data: Vec<u8>,
    pub data_encoding: Encoding,
}

/// Branch metadata: one row per branch of a tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryBranchRow {
    pub shard_id: i32,
    pub tree_id: TreeId,
    pub branch_id: BranchId,
    /// Encoded [`BranchAncestry`]
    pub data: Vec<u8>,
    pub data_encoding: Encoding,
}

/// One ancestor segment of a branch: the ancestor covers node ids in
/// `[begin_node_id, end_node_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestorRange {
    pub branch_id: BranchId,
    pub begin_node_id: i64,
    pub end_node_id: i64,
}

/// Ordered ancestor chain of a branch, root first. Empty for the root
/// branch. The last entry's `end_node_id` is this branch's fork point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchAncestry {
    pub ancestors: Vec<AncestorRange>,
    pub created: DateTime<Utc>,
}

impl BranchAncestry {
    /// Ancestry of a root branch (no parent)
    pub fn root() -> Self {
        Self {
            ancestors: Vec::new(),
            created: Utc::now(),
        }
    }

    /// Ancestry of a branch forked from `parent` at `fork_node_id`,
    /// inheriting the parent's own chain.
    pub fn forked_from(parent: &BranchAncestry, parent_id: BranchId, fork_node_id: i64) -> Self {
        let mut ancestors = parent.ancestors.clone();
        let begin = ancestors.last().map(|a| a.end_node_id).unwrap_or(1);
        ancestors.push(AncestorRange {
            branch_id: parent_id,
            begin_node_id: begin,
            end_node_id: fork_node_id,
        });
        Self {
            ancestors,
            created: Utc::now(),
        }
    }

    /// Encode for the `data` column
    pub fn encode(&self) -> Result<(Vec<u8>, Encoding)> {
        Ok((bincode::serialize(self)?, Encoding::Bincode))
    }

    /// Decode from the `data` column
    pub fn decode(data: &[u8], encoding: Encoding) -> Result<Self> {
        match encoding {
            Encoding::Bincode => Ok(bincode::deserialize(data)?),
        }
    }
}

/// Filter for ranged node reads: `node_id` in `[min_node_id, max_node_id)`
#[derive(Debug, Clone)]
pub struct NodeRangeFilter {
    pub shard_id: i32,
    pub tree_id: TreeId,
    pub branch_id: BranchId,
    pub min_node_id: i64,
    pub max_node_id: i64,
    pub page_size: usize,
}

/// Filter for ranged node deletes: `node_id >= min_node_id`
#[derive(Debug, Clone)]
pub struct NodeDeleteFilter {
    pub shard_id: i32,
    pub tree_id: TreeId,
    pub branch_id: BranchId,
    pub min_node_id: i64,
    pub page_size: usize,
}

/// Keyset position for the global branch scan, ordered by
/// `(storage_shard, shard_id, tree_id, branch_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchScanPosition {
    pub storage_shard: u32,
    pub shard_id: i32,
    pub tree_id: TreeId,
    pub branch_id: BranchId,
}

impl BranchScanPosition {
    /// Position before the first row of the first storage shard
    pub fn start() -> Self {
        Self {
            storage_shard: 0,
            shard_id: i32::MIN,
            tree_id: Uuid::nil(),
            branch_id: Uuid::nil(),
        }
    }
}

/// One quarantined replication task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqRow {
    pub source_cluster: String,
    pub shard_id: i32,
    /// Ordering key within `(source_cluster, shard_id)`
    pub task_id: i64,
    pub data: Vec<u8>,
    pub data_encoding: Encoding,
}
