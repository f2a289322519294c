//! SQLite implementation of StateStore.
//!
//! Entities are stored as JSON bodies next to the columns the engine filters
//! on; progress records get real columns because a separate read API renders
//! them. Every mutation runs in its own short transaction on the blocking
//! pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_shared_types::{
    Cluster, ClusterId, Instance, InstanceId, Node, NodeId, OrchestrationError, Result, TaskState,
    Taskinfo,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::{StateStore, StateStoreError};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS clusters (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS nodes (
        id TEXT PRIMARY KEY,
        cluster_id TEXT NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_nodes_cluster ON nodes (cluster_id);
    CREATE TABLE IF NOT EXISTS instances (
        id TEXT PRIMARY KEY,
        cluster_id TEXT NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_instances_cluster ON instances (cluster_id);
    CREATE TABLE IF NOT EXISTS taskinfo (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        cluster_id TEXT NOT NULL,
        msg TEXT NOT NULL,
        state TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        detail TEXT NOT NULL DEFAULT '',
        UNIQUE (task_id, msg)
    );
    CREATE INDEX IF NOT EXISTS idx_taskinfo_task ON taskinfo (task_id);
";

/// SQLite-backed implementation of StateStore.
#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StateStoreError::ConnectionError(format!("create parent dir: {e}")))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StateStoreError::ConnectionError(format!("open sqlite db: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StateStoreError::ConnectionError(format!("set journal_mode: {e}")))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| StateStoreError::ConnectionError(format!("set synchronous: {e}")))?;
        Ok(Self::from_connection(conn))
    }

    /// Create an in-memory SQLite store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StateStoreError::ConnectionError(format!("open in-memory db: {e}")))?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run one unit of database work on the blocking pool.
    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StateStoreError::ConnectionError("connection mutex poisoned".into()))?;
            f(&mut guard).map_err(|e| StateStoreError::TransactionError(format!("{op}: {e}")))
        })
        .await
        .map_err(|e| StateStoreError::InternalError(format!("{op}: {e}")))?;
        Ok(joined?)
    }

    async fn put_body(
        &self,
        op: &'static str,
        sql: &'static str,
        id: String,
        owner: String,
        name: String,
        status: String,
        body: String,
    ) -> Result<()> {
        self.with_conn(op, move |conn| {
            let tx = conn.transaction()?;
            tx.execute(sql, params![id, owner, name, status, body])?;
            tx.commit()
        })
        .await
    }

    async fn query_bodies(
        &self,
        op: &'static str,
        sql: &'static str,
        key: String,
    ) -> Result<Vec<String>> {
        self.with_conn(op, move |conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
        .await
    }

    async fn delete_by_id(&self, op: &'static str, sql: &'static str, id: String) -> Result<()> {
        self.with_conn(op, move |conn| {
            let tx = conn.transaction()?;
            tx.execute(sql, params![id])?;
            tx.commit()
        })
        .await
    }
}

fn to_body<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| StateStoreError::SerializationError(e.to_string()).into())
}

fn from_body<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body)
        .map_err(|e| StateStoreError::SerializationError(e.to_string()).into())
}

fn from_bodies<T: DeserializeOwned>(bodies: Vec<String>) -> Result<Vec<T>> {
    bodies.iter().map(|b| from_body(b)).collect()
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StateStoreError::SerializationError(format!("timestamp {raw}: {e}")).into())
}

/// Raw taskinfo row before typed conversion.
type TaskinfoRow = (String, String, String, String, String, Option<String>, String);

fn taskinfo_from_row(row: TaskinfoRow) -> Result<Taskinfo> {
    let (task_id, cluster_id, msg, state, start, end, detail) = row;
    Ok(Taskinfo {
        task_id,
        cluster_id: cluster_id
            .parse()
            .map_err(|e| StateStoreError::SerializationError(format!("cluster_id: {e}")))?,
        msg,
        state: state
            .parse::<TaskState>()
            .map_err(|e| OrchestrationError::StateError(e.to_string()))?,
        start_time: parse_time(&start)?,
        end_time: end.as_deref().map(parse_time).transpose()?,
        detail,
    })
}

const TASKINFO_COLUMNS: &str = "task_id, cluster_id, msg, state, start_time, end_time, detail";

fn read_taskinfo_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskinfoRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn initialize(&self) -> Result<()> {
        self.with_conn("ensure schema", |conn| conn.execute_batch(SCHEMA))
            .await
    }

    async fn health_check(&self) -> Result<bool> {
        let ok = self
            .with_conn("health check", |conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            })
            .await
            .is_ok();
        Ok(ok)
    }

    // ===== Cluster Operations =====

    async fn put_cluster(&self, cluster: Cluster) -> Result<()> {
        let body = to_body(&cluster)?;
        let id = cluster.id.to_string();
        let name = cluster.name.clone();
        let status = cluster.status.to_string();
        let updated = cluster.updated_at.to_rfc3339();
        self.with_conn("put cluster", move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO clusters (id, name, status, body, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET name = ?2, status = ?3, body = ?4, updated_at = ?5",
                params![id, name, status, body, updated],
            )?;
            tx.commit()
        })
        .await
    }

    async fn get_cluster(&self, cluster_id: &ClusterId) -> Result<Option<Cluster>> {
        let id = cluster_id.to_string();
        let body = self
            .with_conn("get cluster", move |conn| {
                conn.query_row("SELECT body FROM clusters WHERE id = ?1", params![id], |row| {
                    row.get::<_, String>(0)
                })
                .optional()
            })
            .await?;
        body.as_deref().map(from_body).transpose()
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let bodies = self
            .with_conn("list clusters", |conn| {
                let mut stmt = conn.prepare("SELECT body FROM clusters ORDER BY name")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()
            })
            .await?;
        from_bodies(bodies)
    }

    // ===== Node Operations =====

    async fn put_node(&self, node: Node) -> Result<()> {
        let body = to_body(&node)?;
        self.put_body(
            "put node",
            "INSERT INTO nodes (id, cluster_id, name, status, body) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET cluster_id = ?2, name = ?3, status = ?4, body = ?5",
            node.id.to_string(),
            node.cluster_id.to_string(),
            node.name.clone(),
            node.status.to_string(),
            body,
        )
        .await
    }

    async fn get_node(&self, node_id: &NodeId) -> Result<Option<Node>> {
        let bodies = self
            .query_bodies("get node", "SELECT body FROM nodes WHERE id = ?1", node_id.to_string())
            .await?;
        bodies.first().map(|b| from_body(b)).transpose()
    }

    async fn list_nodes_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<Node>> {
        let bodies = self
            .query_bodies(
                "list nodes",
                "SELECT body FROM nodes WHERE cluster_id = ?1 ORDER BY name",
                cluster_id.to_string(),
            )
            .await?;
        from_bodies(bodies)
    }

    async fn delete_node(&self, node_id: &NodeId) -> Result<()> {
        self.delete_by_id("delete node", "DELETE FROM nodes WHERE id = ?1", node_id.to_string())
            .await
    }

    async fn delete_nodes_for_cluster(&self, cluster_id: &ClusterId) -> Result<()> {
        self.delete_by_id(
            "delete cluster nodes",
            "DELETE FROM nodes WHERE cluster_id = ?1",
            cluster_id.to_string(),
        )
        .await
    }

    // ===== Instance Operations =====

    async fn put_instance(&self, instance: Instance) -> Result<()> {
        let body = to_body(&instance)?;
        self.put_body(
            "put instance",
            "INSERT INTO instances (id, cluster_id, name, status, body) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET cluster_id = ?2, name = ?3, status = ?4, body = ?5",
            instance.id.to_string(),
            instance.cluster_id.to_string(),
            instance.name.clone(),
            instance.status.to_string(),
            body,
        )
        .await
    }

    async fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<Instance>> {
        let bodies = self
            .query_bodies(
                "get instance",
                "SELECT body FROM instances WHERE id = ?1",
                instance_id.to_string(),
            )
            .await?;
        bodies.first().map(|b| from_body(b)).transpose()
    }

    async fn list_instances_for_cluster(&self, cluster_id: &ClusterId) -> Result<Vec<Instance>> {
        let bodies = self
            .query_bodies(
                "list instances",
                "SELECT body FROM instances WHERE cluster_id = ?1 ORDER BY name",
                cluster_id.to_string(),
            )
            .await?;
        from_bodies(bodies)
    }

    async fn delete_instance(&self, instance_id: &InstanceId) -> Result<()> {
        self.delete_by_id(
            "delete instance",
            "DELETE FROM instances WHERE id = ?1",
            instance_id.to_string(),
        )
        .await
    }

    async fn delete_instances_for_cluster(&self, cluster_id: &ClusterId) -> Result<()> {
        self.delete_by_id(
            "delete cluster instances",
            "DELETE FROM instances WHERE cluster_id = ?1",
            cluster_id.to_string(),
        )
        .await
    }

    // ===== Progress Records =====

    async fn upsert_taskinfo(&self, info: Taskinfo) -> Result<()> {
        let start = info.start_time.to_rfc3339();
        let end = info.end_time.map(|t| t.to_rfc3339());
        let state = info.state.to_string();
        let cluster_id = info.cluster_id.to_string();
        self.with_conn("upsert taskinfo", move |conn| {
            let tx = conn.transaction()?;
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM taskinfo WHERE task_id = ?1 AND msg = ?2",
                    params![info.task_id, info.msg],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(row_id) => {
                    tx.execute(
                        "UPDATE taskinfo SET state = ?1, start_time = ?2, end_time = ?3, detail = ?4
                         WHERE id = ?5",
                        params![state, start, end, info.detail, row_id],
                    )?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO taskinfo (task_id, cluster_id, msg, state, start_time, end_time, detail)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![info.task_id, cluster_id, info.msg, state, start, end, info.detail],
                    )?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn get_taskinfo(&self, task_id: &str, msg: &str) -> Result<Option<Taskinfo>> {
        let task_id = task_id.to_string();
        let msg = msg.to_string();
        let row = self
            .with_conn("get taskinfo", move |conn| {
                conn.query_row(
                    &format!("SELECT {TASKINFO_COLUMNS} FROM taskinfo WHERE task_id = ?1 AND msg = ?2"),
                    params![task_id, msg],
                    read_taskinfo_row,
                )
                .optional()
            })
            .await?;
        row.map(taskinfo_from_row).transpose()
    }

    async fn list_taskinfos(&self, task_id: &str) -> Result<Vec<Taskinfo>> {
        let task_id = task_id.to_string();
        let rows = self
            .with_conn("list taskinfos", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASKINFO_COLUMNS} FROM taskinfo WHERE task_id = ?1 ORDER BY start_time, id"
                ))?;
                let rows = stmt.query_map(params![task_id], read_taskinfo_row)?;
                rows.collect::<rusqlite::Result<Vec<TaskinfoRow>>>()
            })
            .await?;
        rows.into_iter().map(taskinfo_from_row).collect()
    }
}
