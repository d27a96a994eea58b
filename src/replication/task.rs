//! Replication Tasks
//!
//! Wire-level task payloads exchanged between clusters, and the version
//! history metadata the applier uses to place incoming batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// One workflow history event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    /// Failover version of the cluster that produced the event
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub payload: Vec<u8>,
}

/// Encode an event batch for the history_node `data` column
pub fn encode_events(events: &[HistoryEvent]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(events)?)
}

/// Decode an event batch from the history_node `data` column
pub fn decode_events(data: &[u8]) -> Result<Vec<HistoryEvent>> {
    Ok(bincode::deserialize(data)?)
}

/// One segment of a version history: all events up to and including
/// `event_id` were produced at `version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    pub event_id: i64,
    pub version: i64,
}

/// Ordered record of which version covers which event-id range of a
/// run. Segments are ordered by increasing event id; versions are
/// non-decreasing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    pub items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    /// Empty history
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Check the ordering invariants
    pub fn validate(&self) -> Result<()> {
        for pair in self.items.windows(2) {
            if pair[1].event_id <= pair[0].event_id {
                return Err(Error::MalformedTask(
                    "version history event ids must be increasing".into(),
                ));
            }
            if pair[1].version < pair[0].version {
                return Err(Error::MalformedTask(
                    "version history versions must be non-decreasing".into(),
                ));
            }
        }
        Ok(())
    }

    /// Last covered event id, or 0 when empty
    pub fn last_event_id(&self) -> i64 {
        self.items.last().map(|item| item.event_id).unwrap_or(0)
    }

    /// Version of the last segment, or 0 when empty
    pub fn last_version(&self) -> i64 {
        self.items.last().map(|item| item.version).unwrap_or(0)
    }

    /// Event id the next appended batch must start at
    pub fn next_event_id(&self) -> i64 {
        self.last_event_id() + 1
    }

    /// Record that events up to `event_id` at `version` are applied.
    /// Extends the last segment when the version matches, opens a new
    /// one when it increases, and rejects regressions.
    pub fn update(&mut self, event_id: i64, version: i64) -> Result<()> {
        if event_id <= self.last_event_id() {
            return Err(Error::MalformedTask(format!(
                "event id {} does not advance version history past {}",
                event_id,
                self.last_event_id()
            )));
        }
        match self.items.last_mut() {
            Some(last) if version == last.version => {
                last.event_id = event_id;
            }
            Some(last) if version < last.version => {
                return Err(Error::MalformedTask(format!(
                    "version {} regresses below {}",
                    version, last.version
                )));
            }
            _ => self.items.push(VersionHistoryItem { event_id, version }),
        }
        Ok(())
    }

    /// Version that produced `event_id`, if this history covers it
    pub fn version_at(&self, event_id: i64) -> Option<i64> {
        if event_id > self.last_event_id() {
            return None;
        }
        self.items
            .iter()
            .find(|item| event_id <= item.event_id)
            .map(|item| item.version)
    }

    /// Lowest common ancestor with another history: the highest event
    /// position on which both histories agree. `None` when they share
    /// no prefix at all.
    pub fn lca(&self, other: &VersionHistory) -> Option<VersionHistoryItem> {
        for local in self.items.iter().rev() {
            for remote in other.items.iter().rev() {
                if local.version == remote.version {
                    return Some(VersionHistoryItem {
                        event_id: local.event_id.min(remote.event_id),
                        version: local.version,
                    });
                }
            }
        }
        None
    }
}

/// Attributes of a history replication task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTaskAttributes {
    /// Source-assigned ordering key; doubles as the fencing token so a
    /// re-delivered task collides with its own first write
    pub task_id: i64,
    pub source_cluster: String,
    /// Logical shard owning the run in the source cluster
    pub shard_id: i32,
    /// The run's history tree
    pub tree_id: Uuid,
    pub first_event_id: i64,
    pub next_event_id: i64,
    pub version: i64,
    /// Version history of the run as seen by the source at emit time
    pub version_history: VersionHistory,
    pub events: Vec<HistoryEvent>,
}

/// Replication task, polymorphic over kind. Only the history variant is
/// applied here; sync-shard heartbeats pass through as no-ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationTask {
    History(HistoryTaskAttributes),
    SyncShard {
        source_cluster: String,
        shard_id: i32,
        timestamp: DateTime<Utc>,
    },
}

impl ReplicationTask {
    /// Serialize for DLQ persistence and transport
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from DLQ or transport bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Task kind name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            ReplicationTask::History(_) => "History",
            ReplicationTask::SyncShard { .. } => "SyncShard",
        }
    }

    /// Source cluster that emitted this task
    pub fn source_cluster(&self) -> &str {
        match self {
            ReplicationTask::History(attrs) => &attrs.source_cluster,
            ReplicationTask::SyncShard { source_cluster, .. } => source_cluster,
        }
    }

    /// Logical shard the task belongs to
    pub fn shard_id(&self) -> i32 {
        match self {
            ReplicationTask::History(attrs) => attrs.shard_id,
            ReplicationTask::SyncShard { shard_id, .. } => *shard_id,
        }
    }

    /// Ordering key; 0 for kinds that carry none
    pub fn task_id(&self) -> i64 {
        match self {
            ReplicationTask::History(attrs) => attrs.task_id,
            ReplicationTask::SyncShard { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(points: &[(i64, i64)]) -> VersionHistory {
        VersionHistory {
            items: points
                .iter()
                .map(|&(event_id, version)| VersionHistoryItem { event_id, version })
                .collect(),
        }
    }

    #[test]
    fn test_update_extends_and_opens_segments() {
        let mut vh = VersionHistory::new();
        vh.update(3, 1).unwrap();
        vh.update(5, 1).unwrap();
        vh.update(8, 2).unwrap();

        assert_eq!(vh.items, history(&[(5, 1), (8, 2)]).items);
        assert_eq!(vh.next_event_id(), 9);
        assert_eq!(vh.last_version(), 2);
    }

    #[test]
    fn test_update_rejects_regression() {
        let mut vh = history(&[(5, 2)]);
        assert!(vh.update(6, 1).is_err());
        assert!(vh.update(4, 2).is_err());
    }

    #[test]
    fn test_version_at() {
        let vh = history(&[(3, 1), (7, 2)]);
        assert_eq!(vh.version_at(1), Some(1));
        assert_eq!(vh.version_at(3), Some(1));
        assert_eq!(vh.version_at(4), Some(2));
        assert_eq!(vh.version_at(7), Some(2));
        assert_eq!(vh.version_at(8), None);
    }

    #[test]
    fn test_lca_picks_highest_common_position() {
        let local = history(&[(3, 1), (7, 2)]);
        let remote = history(&[(3, 1), (5, 3)]);

        let lca = local.lca(&remote).unwrap();
        assert_eq!(lca, VersionHistoryItem { event_id: 3, version: 1 });

        let disjoint = history(&[(4, 9)]);
        assert!(local.lca(&disjoint).is_none());
    }

    #[test]
    fn test_validate_ordering() {
        assert!(history(&[(3, 1), (7, 2)]).validate().is_ok());
        assert!(history(&[(7, 1), (3, 2)]).validate().is_err());
        assert!(history(&[(3, 2), (7, 1)]).validate().is_err());
    }

    #[test]
    fn test_task_round_trip() {
        let task = ReplicationTask::History(HistoryTaskAttributes {
            task_id: 11,
            source_cluster: "active".into(),
            shard_id: 3,
            tree_id: Uuid::new_v4(),
            first_event_id: 1,
            next_event_id: 3,
            version: 1,
            version_history: history(&[(2, 1)]),
            events: vec![HistoryEvent {
                event_id: 1,
                version: 1,
                timestamp: Utc::now(),
                event_type: "WorkflowExecutionStarted".into(),
                payload: vec![1, 2, 3],
            }],
        });

        let bytes = task.serialize().unwrap();
        let restored = ReplicationTask::deserialize(&bytes).unwrap();
        assert_eq!(restored, task);
        assert_eq!(restored.type_name(), "History");
        assert_eq!(restored.task_id(), 11);
        assert_eq!(restored.source_cluster(), "active");
    }
}
