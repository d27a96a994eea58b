//! Histree - Branchable Workflow History Storage and Replication
//!
//! Persists the execution history of long-running workflow runs as an
//! append-only, branchable event log, and applies history replicated
//! from other clusters.
//!
//! # Architecture
//!
//! Each run's history is a *tree* of *branches* (resets,
//! continue-as-new, and multi-region conflict forks each open a
//! branch), physically stored as sharded rows keyed by the tree id. A
//! separate asynchronous pipeline applies event batches produced in
//! other clusters, forking a new branch on version conflict and
//! diverting unplaceable tasks to a dead-letter queue for later
//! inspection and replay.
//!
//! # Features
//!
//! - Deterministic tree-to-shard routing, stable across restarts
//! - Fencing-token writes: the most recent write wins, stale writers
//!   observe a constraint failure instead of silent loss
//! - Ranged, paginated reads and deletes per branch
//! - Keyset-paginated global branch enumeration for maintenance scans
//! - Idempotent, at-least-once replication apply with bounded retries
//! - Paginated DLQ draining per `(source cluster, shard)` pair

pub mod config;
pub mod dlq;
pub mod error;
pub mod logging;
pub mod replication;
pub mod shard;
pub mod store;

pub use config::HistreeConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::HistreeConfig;
    pub use crate::dlq::{DlqPage, DlqStore};
    pub use crate::error::{Error, Result};
    pub use crate::replication::{
        ApplyOutcome, ReplicationApplier, ReplicationFetcher, ReplicationTask,
    };
    pub use crate::store::{
        HistoryDriver, HistoryNodeStore, HistoryTreeStore, MemoryDriver, MySqlDriver,
    };
}
