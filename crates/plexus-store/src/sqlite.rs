use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use plexus_core::error::{PlexusError, Result};
use plexus_core::execution::{NodeExecution, PlanExecution};
use plexus_core::outcome::OutcomeInstance;
use plexus_core::traits::{NodeExecutionStore, OutcomeStore};
use plexus_core::types::Status;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS node_executions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        plan_execution_id TEXT NOT NULL,
        parent_id TEXT,
        previous_id TEXT,
        status TEXT NOT NULL,
        old_retry INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL,
        doc TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_node_executions_plan
        ON node_executions(plan_execution_id, status);
    CREATE INDEX IF NOT EXISTS idx_node_executions_parent
        ON node_executions(parent_id, old_retry);
    CREATE INDEX IF NOT EXISTS idx_node_executions_previous
        ON node_executions(previous_id);

    CREATE TABLE IF NOT EXISTS plan_executions (
        uuid TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        doc TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS outcomes (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        plan_execution_id TEXT NOT NULL,
        producer_runtime_id TEXT NOT NULL,
        scope_runtime_id TEXT NOT NULL,
        name TEXT NOT NULL,
        doc TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_outcomes_key
        ON outcomes(plan_execution_id, scope_runtime_id, name);
    CREATE INDEX IF NOT EXISTS idx_outcomes_producer
        ON outcomes(plan_execution_id, producer_runtime_id);";

/// SQLite-backed store. Each record is a JSON document plus the columns
/// queries filter on; `version` backs compare-and-swap updates.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> PlexusError {
    PlexusError::Database(e.to_string())
}

fn status_column(status: Status) -> String {
    format!("{status:?}")
}

fn to_doc<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_doc<T: DeserializeOwned>(doc: &str) -> Result<T> {
    Ok(serde_json::from_str(doc)?)
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PlexusError::Database(format!("Failed to create db directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_nodes(
        conn: &Connection,
        sql: &str,
        args: Vec<String>,
    ) -> Result<Vec<NodeExecution>> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut nodes = Vec::new();
        for row in rows {
            let doc = row.map_err(db_err)?;
            nodes.push(from_doc(&doc)?);
        }
        Ok(nodes)
    }

    fn query_outcomes(
        conn: &Connection,
        sql: &str,
        args: Vec<String>,
    ) -> Result<Vec<OutcomeInstance>> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut outcomes = Vec::new();
        for row in rows {
            let doc = row.map_err(db_err)?;
            outcomes.push(from_doc(&doc)?);
        }
        Ok(outcomes)
    }

    /// Rewrite a node document and its indexed columns in place.
    fn write_node(conn: &Connection, node: &NodeExecution) -> Result<()> {
        conn.execute(
            "UPDATE node_executions
             SET parent_id = ?2, previous_id = ?3, status = ?4, old_retry = ?5,
                 version = ?6, doc = ?7
             WHERE uuid = ?1",
            params![
                node.uuid,
                node.parent_id,
                node.previous_id,
                status_column(node.status),
                node.old_retry,
                node.version as i64,
                to_doc(node)?,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

impl NodeExecutionStore for SqliteStore {
    fn save(&self, node: NodeExecution) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let doc = to_doc(&node)?;
            let conn = self.conn.lock().map_err(db_err)?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO node_executions
                     (uuid, plan_execution_id, parent_id, previous_id, status, old_retry, version, doc)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        node.uuid,
                        node.plan_execution_id,
                        node.parent_id,
                        node.previous_id,
                        status_column(node.status),
                        node.old_retry,
                        node.version as i64,
                        doc,
                    ],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                return Err(PlexusError::DuplicateNodeExecution(node.uuid));
            }
            Ok(())
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Result<Option<NodeExecution>>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let doc: Option<String> = conn
                .query_row(
                    "SELECT doc FROM node_executions WHERE uuid = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            doc.map(|d| from_doc(&d)).transpose()
        })
    }

    fn replace(&self, mut node: NodeExecution) -> BoxFuture<'_, Result<NodeExecution>> {
        Box::pin(async move {
            let expected = node.version;
            node.version += 1;
            node.last_updated_at = Utc::now();
            let doc = to_doc(&node)?;

            let conn = self.conn.lock().map_err(db_err)?;
            let updated = conn
                .execute(
                    "UPDATE node_executions
                     SET parent_id = ?3, previous_id = ?4, status = ?5, old_retry = ?6,
                         version = ?7, doc = ?8
                     WHERE uuid = ?1 AND version = ?2",
                    params![
                        node.uuid,
                        expected as i64,
                        node.parent_id,
                        node.previous_id,
                        status_column(node.status),
                        node.old_retry,
                        node.version as i64,
                        doc,
                    ],
                )
                .map_err(db_err)?;

            if updated == 0 {
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT version FROM node_executions WHERE uuid = ?1",
                        params![node.uuid],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                return Err(match exists {
                    Some(_) => PlexusError::VersionConflict {
                        id: node.uuid,
                        expected,
                    },
                    None => PlexusError::NodeExecutionNotFound(node.uuid),
                });
            }
            Ok(node)
        })
    }

    fn find_children(
        &self,
        parent_id: &str,
        include_old_retries: bool,
    ) -> BoxFuture<'_, Result<Vec<NodeExecution>>> {
        let parent_id = parent_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let sql = if include_old_retries {
                "SELECT doc FROM node_executions WHERE parent_id = ?1 ORDER BY seq ASC"
            } else {
                "SELECT doc FROM node_executions WHERE parent_id = ?1 AND old_retry = 0 ORDER BY seq ASC"
            };
            Self::query_nodes(&conn, sql, vec![parent_id])
        })
    }

    fn find_by_plan_execution(
        &self,
        plan_execution_id: &str,
        statuses: Vec<Status>,
    ) -> BoxFuture<'_, Result<Vec<NodeExecution>>> {
        let plan_execution_id = plan_execution_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut args = vec![plan_execution_id];
            let sql = if statuses.is_empty() {
                "SELECT doc FROM node_executions WHERE plan_execution_id = ?1 ORDER BY seq ASC"
                    .to_string()
            } else {
                args.extend(statuses.iter().map(|s| status_column(*s)));
                format!(
                    "SELECT doc FROM node_executions
                     WHERE plan_execution_id = ?1 AND status IN ({})
                     ORDER BY seq ASC",
                    placeholders(2, statuses.len())
                )
            };
            Self::query_nodes(&conn, &sql, args)
        })
    }

    fn relink_previous_id(&self, old_id: &str, new_id: &str) -> BoxFuture<'_, Result<usize>> {
        let old_id = old_id.to_string();
        let new_id = new_id.to_string();
        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            let nodes = Self::query_nodes(
                &tx,
                "SELECT doc FROM node_executions WHERE previous_id = ?1 AND uuid != ?2",
                vec![old_id, new_id.clone()],
            )?;
            let now = Utc::now();
            for mut node in nodes.iter().cloned() {
                node.previous_id = Some(new_id.clone());
                node.version += 1;
                node.last_updated_at = now;
                Self::write_node(&tx, &node)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(nodes.len())
        })
    }

    fn mark_old_retry(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            let found = Self::query_nodes(
                &tx,
                "SELECT doc FROM node_executions WHERE uuid = ?1 AND old_retry = 0",
                vec![id],
            )?;
            let Some(mut node) = found.into_iter().next() else {
                return Ok(false);
            };
            node.old_retry = true;
            node.version += 1;
            node.last_updated_at = Utc::now();
            Self::write_node(&tx, &node)?;
            tx.commit().map_err(db_err)?;
            Ok(true)
        })
    }

    fn count_children_with_status(
        &self,
        parent_id: &str,
        statuses: Vec<Status>,
    ) -> BoxFuture<'_, Result<usize>> {
        let parent_id = parent_id.to_string();
        Box::pin(async move {
            if statuses.is_empty() {
                return Ok(0);
            }
            let conn = self.conn.lock().map_err(db_err)?;
            let mut args = vec![parent_id];
            args.extend(statuses.iter().map(|s| status_column(*s)));
            let sql = format!(
                "SELECT COUNT(*) FROM node_executions
                 WHERE parent_id = ?1 AND old_retry = 0 AND status IN ({})",
                placeholders(2, statuses.len())
            );
            let count: i64 = conn
                .query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))
                .map_err(db_err)?;
            Ok(count as usize)
        })
    }

    fn error_out_active_nodes(&self, plan_execution_id: &str) -> BoxFuture<'_, Result<usize>> {
        let plan_execution_id = plan_execution_id.to_string();
        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            let nodes = Self::query_nodes(
                &tx,
                "SELECT doc FROM node_executions WHERE plan_execution_id = ?1",
                vec![plan_execution_id],
            )?;
            let now = Utc::now();
            let mut changed = 0;
            for mut node in nodes.into_iter().filter(|n| !n.status.is_final()) {
                node.status = Status::Errored;
                node.end_ts = Some(now);
                node.version += 1;
                node.last_updated_at = now;
                Self::write_node(&tx, &node)?;
                changed += 1;
            }
            tx.commit().map_err(db_err)?;
            Ok(changed)
        })
    }

    fn save_plan_execution(&self, plan: PlanExecution) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let doc = to_doc(&plan)?;
            let conn = self.conn.lock().map_err(db_err)?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO plan_executions (uuid, version, doc) VALUES (?1, ?2, ?3)",
                    params![plan.uuid, plan.version as i64, doc],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                return Err(PlexusError::InvalidRequest(format!(
                    "plan execution already exists: {}",
                    plan.uuid
                )));
            }
            Ok(())
        })
    }

    fn get_plan_execution(&self, id: &str) -> BoxFuture<'_, Result<Option<PlanExecution>>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let doc: Option<String> = conn
                .query_row(
                    "SELECT doc FROM plan_executions WHERE uuid = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            doc.map(|d| from_doc(&d)).transpose()
        })
    }

    fn replace_plan_execution(
        &self,
        mut plan: PlanExecution,
    ) -> BoxFuture<'_, Result<PlanExecution>> {
        Box::pin(async move {
            let expected = plan.version;
            plan.version += 1;
            let doc = to_doc(&plan)?;
            let conn = self.conn.lock().map_err(db_err)?;
            let updated = conn
                .execute(
                    "UPDATE plan_executions SET version = ?3, doc = ?4 WHERE uuid = ?1 AND version = ?2",
                    params![plan.uuid, expected as i64, plan.version as i64, doc],
                )
                .map_err(db_err)?;
            if updated == 0 {
                return Err(PlexusError::VersionConflict {
                    id: plan.uuid,
                    expected,
                });
            }
            Ok(plan)
        })
    }
}

impl OutcomeStore for SqliteStore {
    fn insert(
        &self,
        outcome: OutcomeInstance,
        enforce_unique_key: bool,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let doc = to_doc(&outcome)?;
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            if enforce_unique_key {
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT uuid FROM outcomes
                         WHERE plan_execution_id = ?1 AND scope_runtime_id = ?2 AND name = ?3",
                        params![outcome.plan_execution_id, outcome.scope_runtime_id, outcome.name],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                if existing.is_some() {
                    return Err(PlexusError::DuplicateOutcome {
                        plan_execution_id: outcome.plan_execution_id,
                        scope_runtime_id: outcome.scope_runtime_id,
                        name: outcome.name,
                    });
                }
            }
            tx.execute(
                "INSERT INTO outcomes
                 (uuid, plan_execution_id, producer_runtime_id, scope_runtime_id, name, doc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    outcome.uuid,
                    outcome.plan_execution_id,
                    outcome.producer_runtime_id,
                    outcome.scope_runtime_id,
                    outcome.name,
                    doc,
                ],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
    }

    fn get(&self, uuid: &str) -> BoxFuture<'_, Result<Option<OutcomeInstance>>> {
        let uuid = uuid.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let found = Self::query_outcomes(
                &conn,
                "SELECT doc FROM outcomes WHERE uuid = ?1",
                vec![uuid],
            )?;
            Ok(found.into_iter().next())
        })
    }

    fn get_many(&self, uuids: Vec<String>) -> BoxFuture<'_, Result<Vec<OutcomeInstance>>> {
        Box::pin(async move {
            if uuids.is_empty() {
                return Ok(vec![]);
            }
            let conn = self.conn.lock().map_err(db_err)?;
            let sql = format!(
                "SELECT doc FROM outcomes WHERE uuid IN ({})",
                placeholders(1, uuids.len())
            );
            let found = Self::query_outcomes(&conn, &sql, uuids.clone())?;
            // Preserve the caller's order
            Ok(uuids
                .iter()
                .filter_map(|id| found.iter().find(|o| &o.uuid == id).cloned())
                .collect())
        })
    }

    fn find_latest(
        &self,
        plan_execution_id: &str,
        scope_runtime_id: &str,
        name: &str,
    ) -> BoxFuture<'_, Result<Option<OutcomeInstance>>> {
        let args = vec![
            plan_execution_id.to_string(),
            scope_runtime_id.to_string(),
            name.to_string(),
        ];
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let found = Self::query_outcomes(
                &conn,
                "SELECT doc FROM outcomes
                 WHERE plan_execution_id = ?1 AND scope_runtime_id = ?2 AND name = ?3
                 ORDER BY seq DESC LIMIT 1",
                args,
            )?;
            Ok(found.into_iter().next())
        })
    }

    fn find_all_by_runtime_id(
        &self,
        plan_execution_id: &str,
        producer_runtime_id: &str,
    ) -> BoxFuture<'_, Result<Vec<OutcomeInstance>>> {
        let args = vec![plan_execution_id.to_string(), producer_runtime_id.to_string()];
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            Self::query_outcomes(
                &conn,
                "SELECT doc FROM outcomes
                 WHERE plan_execution_id = ?1 AND producer_runtime_id = ?2
                 ORDER BY seq ASC",
                args,
            )
        })
    }
}
