//! Replication Applier
//!
//! Applies incoming replication tasks to the local history store.
//! Every task moves Received → Validated → {Applied | Forked |
//! Quarantined}: a batch that continues a tracked branch is appended in
//! place; a batch whose version disagrees with the tracked branch at
//! the same position forks a new branch at the last common position; a
//! batch that cannot be placed consistently is quarantined to the DLQ.
//!
//! Apply is idempotent: re-delivery of an applied task is recognized
//! either by the tracked version history or, after a restart, by the
//! append fencing-token check, and is a successful no-op.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use super::task::{
    decode_events, encode_events, HistoryTaskAttributes, ReplicationTask, VersionHistory,
};
use crate::dlq::DlqStore;
use crate::error::{Error, Result};
use crate::store::{
    BranchAncestry, BranchId, Encoding, HistoryBranchRow, HistoryNodeRow, HistoryNodeStore,
    HistoryTreeStore, NodeRangeFilter, TreeId,
};

/// Page size for branch rebuilds after a restart
const HYDRATE_PAGE_SIZE: usize = 256;

/// Tracked-run map size at which idle entries are evicted
const MAX_TRACKED_RUNS: usize = 1024;

/// Terminal state of one apply attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Batch appended to an existing branch (or recognized as already
    /// applied)
    Applied,
    /// Version conflict; batch appended to a newly created branch
    Forked { new_branch: BranchId },
    /// Task diverted to the DLQ
    Quarantined,
}

/// Tracked state of one branch of a run
struct BranchState {
    branch_id: BranchId,
    history: VersionHistory,
}

/// Tracked state of one run (tree)
#[derive(Default)]
struct RunState {
    branches: Vec<BranchState>,
    /// Whether `branches` reflects storage; false until hydrated
    hydrated: bool,
}

/// Applies replication tasks against the history stores
pub struct ReplicationApplier {
    nodes: Arc<HistoryNodeStore>,
    trees: Arc<HistoryTreeStore>,
    dlq: Arc<DlqStore>,
    runs: Mutex<HashMap<TreeId, Arc<Mutex<RunState>>>>,
}

impl ReplicationApplier {
    /// Create an applier over the three stores
    pub fn new(
        nodes: Arc<HistoryNodeStore>,
        trees: Arc<HistoryTreeStore>,
        dlq: Arc<DlqStore>,
    ) -> Self {
        Self {
            nodes,
            trees,
            dlq,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Per-tree state handle. The map lock is held only for the lookup
    /// and eviction; storage calls run under the tree's own lock, so a
    /// stalled store call for one tree never serializes the others.
    async fn run_state(&self, tree_id: TreeId) -> Arc<Mutex<RunState>> {
        let mut runs = self.runs.lock().await;
        if runs.len() >= MAX_TRACKED_RUNS {
            // Idle entries (not held by any in-flight apply) are safe to
            // drop; hydration rebuilds them from storage on demand.
            runs.retain(|id, run| *id == tree_id || Arc::strong_count(run) > 1);
        }
        runs.entry(tree_id).or_default().clone()
    }

    #[cfg(test)]
    async fn tracked_runs(&self) -> usize {
        self.runs.lock().await.len()
    }

    /// Apply one task. Retryable errors (transient store failures,
    /// event gaps) surface as `Err`; everything else resolves to an
    /// [`ApplyOutcome`].
    pub async fn apply(&self, task: &ReplicationTask) -> Result<ApplyOutcome> {
        match task {
            ReplicationTask::History(attrs) => self.apply_history(task, attrs).await,
            ReplicationTask::SyncShard { source_cluster, shard_id, .. } => {
                tracing::debug!(source_cluster, shard_id, "sync-shard task, nothing to apply");
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    /// Divert a task to the DLQ. Terminal for this delivery attempt;
    /// the task can later be re-driven through `apply`.
    pub async fn quarantine(&self, task: &ReplicationTask, reason: &str) -> Result<ApplyOutcome> {
        tracing::warn!(
            task_id = task.task_id(),
            kind = task.type_name(),
            reason,
            "quarantining replication task"
        );
        self.dlq.enqueue(task).await?;
        Ok(ApplyOutcome::Quarantined)
    }

    async fn apply_history(
        &self,
        task: &ReplicationTask,
        attrs: &HistoryTaskAttributes,
    ) -> Result<ApplyOutcome> {
        if let Err(err) = validate(attrs) {
            return self.quarantine(task, &err.to_string()).await;
        }

        let run = self.run_state(attrs.tree_id).await;
        let mut state = run.lock().await;
        if !state.hydrated {
            *state = self.hydrate(attrs.shard_id, attrs.tree_id).await?;
        }

        // New run: the first batch opens the root branch.
        if state.branches.is_empty() {
            if attrs.first_event_id != 1 {
                return Err(Error::EventGap { expected: 1, got: attrs.first_event_id });
            }
            let branch_id = Uuid::new_v4();
            self.create_branch(attrs, branch_id, BranchAncestry::root()).await?;
            self.append_batch(attrs, branch_id).await?;
            state.branches.push(BranchState {
                branch_id,
                history: attrs.version_history.clone(),
            });
            tracing::info!(tree_id = %attrs.tree_id, branch_id = %branch_id, "opened root branch");
            return Ok(ApplyOutcome::Applied);
        }

        // Continuation of a tracked branch. Sibling branches can share
        // the same next position after a fork, so the target must also
        // agree with the incoming history up to its own last event.
        for branch in state.branches.iter_mut() {
            if attrs.first_event_id == branch.history.next_event_id()
                && attrs.version >= branch.history.last_version()
                && branch
                    .history
                    .lca(&attrs.version_history)
                    .is_some_and(|lca| lca.event_id == branch.history.last_event_id())
            {
                self.append_batch(attrs, branch.branch_id).await?;
                branch.history.update(attrs.next_event_id - 1, attrs.version)?;
                return Ok(ApplyOutcome::Applied);
            }
        }

        // Already applied: the batch is covered by a branch at the same
        // version. Second delivery is a no-op, not an error.
        for branch in &state.branches {
            if attrs.next_event_id - 1 <= branch.history.last_event_id()
                && branch.history.version_at(attrs.first_event_id) == Some(attrs.version)
            {
                tracing::debug!(
                    tree_id = %attrs.tree_id,
                    task_id = attrs.task_id,
                    "duplicate delivery, already applied"
                );
                return Ok(ApplyOutcome::Applied);
            }
        }

        // Version conflict at a covered position: fork.
        for index in 0..state.branches.len() {
            let covered = state.branches[index]
                .history
                .version_at(attrs.first_event_id)
                .is_some_and(|v| v != attrs.version);
            if covered {
                return self.fork(attrs, &mut state, index, task).await;
            }
        }

        // The batch starts beyond every tracked branch: missing
        // intermediate events. Retryable; a later delivery fills the gap.
        let expected = state
            .branches
            .iter()
            .map(|b| b.history.next_event_id())
            .max()
            .unwrap_or(1);
        Err(Error::EventGap { expected, got: attrs.first_event_id })
    }

    /// Create a new branch at the last position the conflicting
    /// histories agree on and append the batch there.
    async fn fork(
        &self,
        attrs: &HistoryTaskAttributes,
        state: &mut RunState,
        parent_index: usize,
        task: &ReplicationTask,
    ) -> Result<ApplyOutcome> {
        let parent_history = &state.branches[parent_index].history;
        let Some(lca) = parent_history.lca(&attrs.version_history) else {
            return self.quarantine(task, "no common ancestor with any tracked branch").await;
        };

        let fork_node = lca.event_id + 1;
        if attrs.first_event_id > fork_node {
            // Divergent events between the fork point and this batch
            // have not arrived yet.
            return Err(Error::EventGap { expected: fork_node, got: attrs.first_event_id });
        }
        if attrs.first_event_id < fork_node {
            return self.quarantine(task, "conflicting batch overlaps common history").await;
        }

        let parent_id = state.branches[parent_index].branch_id;
        let parent_ancestry = self.load_ancestry(attrs.shard_id, attrs.tree_id, parent_id).await?;
        let ancestry = BranchAncestry::forked_from(&parent_ancestry, parent_id, fork_node);

        let branch_id = Uuid::new_v4();
        self.create_branch(attrs, branch_id, ancestry).await?;
        self.append_batch(attrs, branch_id).await?;
        state.branches.push(BranchState {
            branch_id,
            history: attrs.version_history.clone(),
        });

        tracing::info!(
            tree_id = %attrs.tree_id,
            parent_branch = %parent_id,
            new_branch = %branch_id,
            fork_node,
            version = attrs.version,
            "version conflict, forked new branch"
        );
        Ok(ApplyOutcome::Forked { new_branch: branch_id })
    }

    async fn create_branch(
        &self,
        attrs: &HistoryTaskAttributes,
        branch_id: BranchId,
        ancestry: BranchAncestry,
    ) -> Result<()> {
        let (data, data_encoding) = ancestry.encode()?;
        self.trees
            .create_branch(HistoryBranchRow {
                shard_id: attrs.shard_id,
                tree_id: attrs.tree_id,
                branch_id,
                data,
                data_encoding,
            })
            .await
    }

    /// Append the task's event batch as one node. The task id doubles
    /// as the fencing token, so a re-delivered task collides with its
    /// own first write and the constraint failure is a no-op.
    async fn append_batch(&self, attrs: &HistoryTaskAttributes, branch_id: BranchId) -> Result<()> {
        let row = HistoryNodeRow {
            shard_id: attrs.shard_id,
            tree_id: attrs.tree_id,
            branch_id,
            node_id: attrs.first_event_id,
            txn_id: attrs.task_id,
            data: encode_events(&attrs.events)?,
            data_encoding: Encoding::Bincode,
        };

        match self.nodes.append(row).await {
            Ok(()) => Ok(()),
            Err(Error::ConstraintViolation { .. }) => {
                tracing::debug!(
                    tree_id = %attrs.tree_id,
                    node_id = attrs.first_event_id,
                    "node already written, treating re-delivery as success"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn load_ancestry(
        &self,
        shard_id: i32,
        tree_id: TreeId,
        branch_id: BranchId,
    ) -> Result<BranchAncestry> {
        let rows = self.trees.list_branches(shard_id, tree_id).await?;
        let row = rows
            .into_iter()
            .find(|row| row.branch_id == branch_id)
            .ok_or(Error::UnknownBranch { tree_id, branch_id })?;
        BranchAncestry::decode(&row.data, row.data_encoding)
    }

    /// Rebuild a run's tracked state from storage, replaying each
    /// branch's ancestors and own nodes in order. Used when a tree is
    /// first seen after a restart; also the replication catch-up read
    /// path.
    async fn hydrate(&self, shard_id: i32, tree_id: TreeId) -> Result<RunState> {
        let rows = self.trees.list_branches(shard_id, tree_id).await?;
        let mut state = RunState::default();

        for row in rows {
            let ancestry = BranchAncestry::decode(&row.data, row.data_encoding)?;
            let mut history = VersionHistory::new();

            for ancestor in &ancestry.ancestors {
                self.replay_nodes(
                    shard_id,
                    tree_id,
                    ancestor.branch_id,
                    ancestor.begin_node_id,
                    ancestor.end_node_id,
                    &mut history,
                )
                .await?;
            }

            let own_min = ancestry.ancestors.last().map(|a| a.end_node_id).unwrap_or(1);
            self.replay_nodes(shard_id, tree_id, row.branch_id, own_min, i64::MAX, &mut history)
                .await?;

            state.branches.push(BranchState { branch_id: row.branch_id, history });
        }

        if !state.branches.is_empty() {
            tracing::info!(
                tree_id = %tree_id,
                branches = state.branches.len(),
                "hydrated run state from storage"
            );
        }
        state.hydrated = true;
        Ok(state)
    }

    async fn replay_nodes(
        &self,
        shard_id: i32,
        tree_id: TreeId,
        branch_id: BranchId,
        min_node_id: i64,
        max_node_id: i64,
        history: &mut VersionHistory,
    ) -> Result<()> {
        let mut min = min_node_id;
        loop {
            let rows = self
                .nodes
                .read_range(NodeRangeFilter {
                    shard_id,
                    tree_id,
                    branch_id,
                    min_node_id: min,
                    max_node_id,
                    page_size: HYDRATE_PAGE_SIZE,
                })
                .await?;
            if rows.is_empty() {
                return Ok(());
            }

            // Within one node the most recent write comes first; older
            // fencing-token losers are skipped.
            let mut last_node = None;
            for row in &rows {
                if last_node == Some(row.node_id) {
                    continue;
                }
                last_node = Some(row.node_id);
                for event in decode_events(&row.data)? {
                    // A fork can land mid-batch; events at or past the
                    // segment end belong to the descendant branch.
                    if event.event_id >= max_node_id {
                        continue;
                    }
                    history.update(event.event_id, event.version)?;
                }
            }

            min = rows.last().expect("rows non-empty").node_id + 1;
        }
    }
}

/// Received → Validated: structural checks on the task itself. A task
/// failing these can never be placed and goes straight to the DLQ.
fn validate(attrs: &HistoryTaskAttributes) -> Result<()> {
    if attrs.task_id <= 0 {
        return Err(Error::MalformedTask("task id must be positive".into()));
    }
    if attrs.events.is_empty() {
        return Err(Error::MalformedTask("empty event batch".into()));
    }
    if attrs.next_event_id != attrs.first_event_id + attrs.events.len() as i64 {
        return Err(Error::MalformedTask(format!(
            "event range [{}, {}) does not match batch of {} events",
            attrs.first_event_id,
            attrs.next_event_id,
            attrs.events.len()
        )));
    }
    for (offset, event) in attrs.events.iter().enumerate() {
        if event.event_id != attrs.first_event_id + offset as i64 {
            return Err(Error::MalformedTask(format!(
                "non-contiguous event id {} at offset {}",
                event.event_id, offset
            )));
        }
        if event.version != attrs.version {
            return Err(Error::MalformedTask(format!(
                "event {} carries version {}, batch asserts {}",
                event.event_id, event.version, attrs.version
            )));
        }
    }
    attrs.version_history.validate()?;
    if attrs.version_history.last_event_id() < attrs.next_event_id - 1 {
        return Err(Error::MalformedTask(
            "version history does not cover the event batch".into(),
        ));
    }
    Ok(())
}
