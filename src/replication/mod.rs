//! Replication
//!
//! Asynchronous, idempotent application of history event batches
//! replicated from other clusters, with version-conflict forking and
//! DLQ quarantine.

pub mod applier;
pub mod fetcher;
pub mod task;

pub use applier::{ApplyOutcome, ReplicationApplier};
pub use fetcher::{poll_until, ReplicationFetcher};
pub use task::{
    HistoryEvent, HistoryTaskAttributes, ReplicationTask, VersionHistory, VersionHistoryItem,
};

pub use crate::config::ReplicationConfig;
