//! MySQL Driver
//!
//! Production [`HistoryDriver`] over sqlx with one connection pool per
//! storage shard. Query shapes are the durable on-disk contract; the
//! `ORDER BY ... LIMIT` forms on deletes bound the rows touched per
//! call so branch truncation can loop in pages.

use std::time::Duration;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};
use uuid::Uuid;

use super::driver::HistoryDriver;
use super::{
    BranchScanPosition, DlqRow, Encoding, HistoryBranchRow, HistoryNodeRow, NodeDeleteFilter,
    NodeRangeFilter,
};
use crate::config::HistreeConfig;
use crate::error::{Error, Result};

const INSERT_NODE: &str = "INSERT INTO history_node \
    (shard_id, tree_id, branch_id, node_id, txn_id, data, data_encoding) \
    VALUES (?, ?, ?, ?, ?, ?, ?)";

const SELECT_NODES: &str = "SELECT shard_id, tree_id, branch_id, node_id, txn_id, data, data_encoding \
    FROM history_node \
    WHERE shard_id = ? AND tree_id = ? AND branch_id = ? AND node_id >= ? AND node_id < ? \
    ORDER BY shard_id, tree_id, branch_id, node_id, txn_id LIMIT ?";

const DELETE_NODES: &str = "DELETE FROM history_node \
    WHERE shard_id = ? AND tree_id = ? AND branch_id = ? AND node_id >= ? \
    ORDER BY shard_id, tree_id, branch_id, node_id, txn_id LIMIT ?";

const INSERT_BRANCH: &str = "INSERT INTO history_tree \
    (shard_id, tree_id, branch_id, data, data_encoding) \
    VALUES (?, ?, ?, ?, ?)";

const SELECT_BRANCHES: &str = "SELECT shard_id, tree_id, branch_id, data, data_encoding \
    FROM history_tree WHERE shard_id = ? AND tree_id = ?";

const DELETE_BRANCH: &str =
    "DELETE FROM history_tree WHERE shard_id = ? AND tree_id = ? AND branch_id = ?";

// Keyset pagination: same shard+tree with a later branch, OR same shard
// with a later tree, OR a later shard.
const SCAN_BRANCHES: &str = "SELECT shard_id, tree_id, branch_id, data, data_encoding \
    FROM history_tree \
    WHERE (shard_id = ? AND tree_id = ? AND branch_id > ?) \
       OR (shard_id = ? AND tree_id > ?) \
       OR (shard_id > ?) \
    ORDER BY shard_id, tree_id, branch_id LIMIT ?";

const INSERT_DLQ: &str = "INSERT INTO replication_tasks_dlq \
    (source_cluster_name, shard_id, task_id, data, data_encoding) \
    VALUES (?, ?, ?, ?, ?) \
    ON DUPLICATE KEY UPDATE data = VALUES(data), data_encoding = VALUES(data_encoding)";

const SELECT_DLQ: &str = "SELECT source_cluster_name, shard_id, task_id, data, data_encoding \
    FROM replication_tasks_dlq \
    WHERE source_cluster_name = ? AND shard_id = ? AND task_id >= ? AND task_id < ? \
    ORDER BY task_id LIMIT ?";

const DELETE_DLQ: &str = "DELETE FROM replication_tasks_dlq \
    WHERE source_cluster_name = ? AND shard_id = ? AND task_id <= ?";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS history_node (
        shard_id INT NOT NULL,
        tree_id CHAR(36) NOT NULL,
        branch_id CHAR(36) NOT NULL,
        node_id BIGINT NOT NULL,
        txn_id BIGINT NOT NULL,
        data MEDIUMBLOB NOT NULL,
        data_encoding VARCHAR(16) NOT NULL,
        PRIMARY KEY (shard_id, tree_id, branch_id, node_id, txn_id)
    )",
    "CREATE TABLE IF NOT EXISTS history_tree (
        shard_id INT NOT NULL,
        tree_id CHAR(36) NOT NULL,
        branch_id CHAR(36) NOT NULL,
        data MEDIUMBLOB NOT NULL,
        data_encoding VARCHAR(16) NOT NULL,
        PRIMARY KEY (shard_id, tree_id, branch_id)
    )",
    "CREATE TABLE IF NOT EXISTS replication_tasks_dlq (
        source_cluster_name VARCHAR(255) NOT NULL,
        shard_id INT NOT NULL,
        task_id BIGINT NOT NULL,
        data MEDIUMBLOB NOT NULL,
        data_encoding VARCHAR(16) NOT NULL,
        PRIMARY KEY (source_cluster_name, shard_id, task_id)
    )",
];

/// MySQL history driver with one pool per storage shard
pub struct MySqlDriver {
    pools: Vec<MySqlPool>,
}

impl MySqlDriver {
    /// Connect one pool per storage shard from the configuration
    pub async fn connect(config: &HistreeConfig) -> Result<Self> {
        let mut pools = Vec::with_capacity(config.storage.storage_shards as usize);
        for shard in 0..config.storage.storage_shards {
            let pool = MySqlPoolOptions::new()
                .max_connections(config.storage.pool_size)
                .acquire_timeout(Duration::from_secs(config.storage.connect_timeout_secs))
                .connect(&config.shard_url(shard))
                .await?;
            pools.push(pool);
        }
        Ok(Self { pools })
    }

    /// Build from pre-connected pools (one per storage shard)
    pub fn from_pools(pools: Vec<MySqlPool>) -> Self {
        Self { pools }
    }

    /// Create the three tables on every storage shard if missing
    pub async fn install_schema(&self) -> Result<()> {
        for (shard, pool) in self.pools.iter().enumerate() {
            for ddl in SCHEMA {
                sqlx::query(ddl).execute(pool).await?;
            }
            tracing::info!(storage_shard = shard, "history schema installed");
        }
        Ok(())
    }

    /// Close all pools
    pub async fn close(&self) {
        for pool in &self.pools {
            pool.close().await;
        }
    }

    fn pool(&self, storage_shard: u32) -> Result<&MySqlPool> {
        self.pools
            .get(storage_shard as usize)
            .ok_or_else(|| Error::Internal(format!("storage shard {} out of range", storage_shard)))
    }
}

/// MySQL duplicate-key error (ER_DUP_ENTRY)
fn is_dup_key(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
            .map(|e| e.number() == 1062)
            .unwrap_or(false),
        _ => false,
    }
}

fn node_row(row: &sqlx::mysql::MySqlRow) -> Result<HistoryNodeRow> {
    Ok(HistoryNodeRow {
        shard_id: row.try_get("shard_id")?,
        tree_id: parse_uuid(row.try_get("tree_id")?)?,
        branch_id: parse_uuid(row.try_get("branch_id")?)?,
        node_id: row.try_get("node_id")?,
        txn_id: row.try_get("txn_id")?,
        data: row.try_get("data")?,
        data_encoding: Encoding::parse(row.try_get::<&str, _>("data_encoding")?)?,
    })
}

fn branch_row(row: &sqlx::mysql::MySqlRow) -> Result<HistoryBranchRow> {
    Ok(HistoryBranchRow {
        shard_id: row.try_get("shard_id")?,
        tree_id: parse_uuid(row.try_get("tree_id")?)?,
        branch_id: parse_uuid(row.try_get("branch_id")?)?,
        data: row.try_get("data")?,
        data_encoding: Encoding::parse(row.try_get::<&str, _>("data_encoding")?)?,
    })
}

fn dlq_row(row: &sqlx::mysql::MySqlRow) -> Result<DlqRow> {
    Ok(DlqRow {
        source_cluster: row.try_get("source_cluster_name")?,
        shard_id: row.try_get("shard_id")?,
        task_id: row.try_get("task_id")?,
        data: row.try_get("data")?,
        data_encoding: Encoding::parse(row.try_get::<&str, _>("data_encoding")?)?,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Internal(format!("corrupt uuid column: {}", e)))
}

#[async_trait::async_trait]
impl HistoryDriver for MySqlDriver {
    fn total_shards(&self) -> u32 {
        self.pools.len() as u32
    }

    async fn insert_node(&self, storage_shard: u32, row: HistoryNodeRow) -> Result<()> {
        let result = sqlx::query(INSERT_NODE)
            .bind(row.shard_id)
            .bind(row.tree_id.to_string())
            .bind(row.branch_id.to_string())
            .bind(row.node_id)
            .bind(row.txn_id)
            .bind(&row.data)
            .bind(row.data_encoding.as_str())
            .execute(self.pool(storage_shard)?)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_dup_key(&err) => Err(Error::ConstraintViolation {
                tree_id: row.tree_id,
                branch_id: row.branch_id,
                node_id: row.node_id,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn select_nodes(
        &self,
        storage_shard: u32,
        filter: &NodeRangeFilter,
    ) -> Result<Vec<HistoryNodeRow>> {
        let rows = sqlx::query(SELECT_NODES)
            .bind(filter.shard_id)
            .bind(filter.tree_id.to_string())
            .bind(filter.branch_id.to_string())
            .bind(filter.min_node_id)
            .bind(filter.max_node_id)
            .bind(filter.page_size as i64)
            .fetch_all(self.pool(storage_shard)?)
            .await?;

        rows.iter().map(node_row).collect()
    }

    async fn delete_nodes(&self, storage_shard: u32, filter: &NodeDeleteFilter) -> Result<u64> {
        let result = sqlx::query(DELETE_NODES)
            .bind(filter.shard_id)
            .bind(filter.tree_id.to_string())
            .bind(filter.branch_id.to_string())
            .bind(filter.min_node_id)
            .bind(filter.page_size as i64)
            .execute(self.pool(storage_shard)?)
            .await?;

        Ok(result.rows_affected())
    }

    async fn insert_branch(&self, storage_shard: u32, row: HistoryBranchRow) -> Result<()> {
        let result = sqlx::query(INSERT_BRANCH)
            .bind(row.shard_id)
            .bind(row.tree_id.to_string())
            .bind(row.branch_id.to_string())
            .bind(&row.data)
            .bind(row.data_encoding.as_str())
            .execute(self.pool(storage_shard)?)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_dup_key(&err) => Err(Error::DuplicateBranch {
                tree_id: row.tree_id,
                branch_id: row.branch_id,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn select_branches(
        &self,
        storage_shard: u32,
        shard_id: i32,
        tree_id: Uuid,
    ) -> Result<Vec<HistoryBranchRow>> {
        let rows = sqlx::query(SELECT_BRANCHES)
            .bind(shard_id)
            .bind(tree_id.to_string())
            .fetch_all(self.pool(storage_shard)?)
            .await?;

        rows.iter().map(branch_row).collect()
    }

    async fn delete_branch(
        &self,
        storage_shard: u32,
        shard_id: i32,
        tree_id: Uuid,
        branch_id: Uuid,
    ) -> Result<u64> {
        let result = sqlx::query(DELETE_BRANCH)
            .bind(shard_id)
            .bind(tree_id.to_string())
            .bind(branch_id.to_string())
            .execute(self.pool(storage_shard)?)
            .await?;

        Ok(result.rows_affected())
    }

    async fn scan_branches(
        &self,
        storage_shard: u32,
        after: &BranchScanPosition,
        page_size: usize,
    ) -> Result<Vec<HistoryBranchRow>> {
        let rows = sqlx::query(SCAN_BRANCHES)
            .bind(after.shard_id)
            .bind(after.tree_id.to_string())
            .bind(after.branch_id.to_string())
            .bind(after.shard_id)
            .bind(after.tree_id.to_string())
            .bind(after.shard_id)
            .bind(page_size as i64)
            .fetch_all(self.pool(storage_shard)?)
            .await?;

        rows.iter().map(branch_row).collect()
    }

    async fn insert_dlq(&self, storage_shard: u32, row: DlqRow) -> Result<()> {
        sqlx::query(INSERT_DLQ)
            .bind(&row.source_cluster)
            .bind(row.shard_id)
            .bind(row.task_id)
            .bind(&row.data)
            .bind(row.data_encoding.as_str())
            .execute(self.pool(storage_shard)?)
            .await?;
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
        let rows = sqlx::query(SELECT_DLQ)
            .bind(source_cluster)
            .bind(shard_id)
            .bind(min_task_id)
            .bind(max_task_id)
            .bind(page_size as i64)
            .fetch_all(self.pool(storage_shard)?)
            .await?;

        rows.iter().map(dlq_row).collect()
    }

    async fn delete_dlq(
        &self,
        storage_shard: u32,
        source_cluster: &str,
        shard_id: i32,
        upto_task_id: i64,
    ) -> Result<u64> {
        let result = sqlx::query(DELETE_DLQ)
            .bind(source_cluster)
            .bind(shard_id)
            .bind(upto_task_id)
            .execute(self.pool(storage_shard)?)
            .await?;

        Ok(result.rows_affected())
    }
}
