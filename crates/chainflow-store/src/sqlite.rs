use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::graph::GraphDefinition;
use chainflow_core::traits::{GraphStore, RunStore};
use chainflow_core::types::{
    GraphId, LogEntry, RunFailure, RunId, RunRecord, RunStatus, WorkflowState,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS graphs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        definition TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS runs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        graph_id TEXT NOT NULL,
        status TEXT NOT NULL,
        state TEXT NOT NULL,
        failure TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_graph ON runs(graph_id, seq);

    CREATE TABLE IF NOT EXISTS run_log_entries (
        run_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        entry TEXT NOT NULL,
        PRIMARY KEY (run_id, seq)
    );
";

/// SQLite-backed graph and run repository.
///
/// States, log entries and definitions are stored as JSON text. Log entries
/// live one per row in `run_log_entries`, so appending to a pending run costs
/// the same however long its log is. Every operation runs under the
/// connection mutex, so each one is atomic for concurrent callers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> ChainflowError {
    ChainflowError::Database(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(db_err)
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ChainflowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL for concurrent readers
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

    fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        state: &WorkflowState,
        log: &[LogEntry],
        failure: Option<&RunFailure>,
    ) -> Result<()> {
        let state_json = serde_json::to_string(state)?;
        let entries = log
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let failure_json = failure.map(serde_json::to_string).transpose()?;

        let mut conn = self.conn.lock().map_err(db_err)?;
        let tx = conn.transaction().map_err(db_err)?;
        let changed = tx
            .execute(
                "UPDATE runs SET status = ?1, state = ?2, failure = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    status.as_str(),
                    state_json,
                    failure_json,
                    Utc::now().to_rfc3339(),
                    run_id.0,
                ],
            )
            .map_err(db_err)?;

        if changed == 0 {
            return Err(ChainflowError::RunNotFound(run_id.0.clone()));
        }

        // The final log replaces whatever progress was streamed in.
        tx.execute(
            "DELETE FROM run_log_entries WHERE run_id = ?1",
            params![run_id.0],
        )
        .map_err(db_err)?;
        {
            let mut insert = tx
                .prepare("INSERT INTO run_log_entries (run_id, seq, entry) VALUES (?1, ?2, ?3)")
                .map_err(db_err)?;
            for (seq, entry) in entries.iter().enumerate() {
                insert
                    .execute(params![run_id.0, seq as i64, entry])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }
}

impl GraphStore for SqliteStore {
    fn create(&self, definition: GraphDefinition) -> BoxFuture<'_, Result<GraphId>> {
        Box::pin(async move {
            definition.validate()?;
            let graph_id = GraphId::new();
            let json = serde_json::to_string(&definition)?;

            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO graphs (id, definition, created_at) VALUES (?1, ?2, ?3)",
                params![graph_id.0, json, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;

            debug!(graph_id = %graph_id, "Graph stored");
            Ok(graph_id)
        })
    }

    fn get(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<GraphDefinition>> {
        let graph_id = graph_id.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT definition FROM graphs WHERE id = ?1",
                    params![graph_id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match json {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Err(ChainflowError::GraphNotFound(graph_id.0)),
            }
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<GraphId>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare("SELECT id FROM graphs ORDER BY seq ASC")
                .map_err(db_err)?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .map(|r| r.map(GraphId).map_err(db_err))
                .collect::<Result<Vec<_>>>()?;
            Ok(ids)
        })
    }
}

impl RunStore for SqliteStore {
    fn create_pending(
        &self,
        graph_id: &GraphId,
        initial_state: &WorkflowState,
    ) -> BoxFuture<'_, Result<RunId>> {
        let graph_id = graph_id.clone();
        let state_json = serde_json::to_string(initial_state);

        Box::pin(async move {
            let state_json = state_json?;
            let run_id = RunId::new();
            let now = Utc::now().to_rfc3339();

            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO runs (id, graph_id, status, state, failure, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?5)",
                params![
                    run_id.0,
                    graph_id.0,
                    RunStatus::Pending.as_str(),
                    state_json,
                    now,
                ],
            )
            .map_err(db_err)?;

            Ok(run_id)
        })
    }

    fn append_log(&self, run_id: &RunId, entry: &LogEntry) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        let entry_json = serde_json::to_string(entry);

        Box::pin(async move {
            let entry_json = entry_json?;
            let conn = self.conn.lock().map_err(db_err)?;
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM runs WHERE id = ?1",
                    params![run_id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            let status = status.ok_or_else(|| ChainflowError::RunNotFound(run_id.0.clone()))?;
            if status != RunStatus::Pending.as_str() {
                return Ok(());
            }

            conn.execute(
                "INSERT INTO run_log_entries (run_id, seq, entry)
                 VALUES (?1, (SELECT COALESCE(MAX(seq) + 1, 0) FROM run_log_entries WHERE run_id = ?1), ?2)",
                params![run_id.0, entry_json],
            )
            .map_err(db_err)?;
            conn.execute(
                "UPDATE runs SET updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), run_id.0],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn complete(
        &self,
        run_id: &RunId,
        final_state: &WorkflowState,
        log: &[LogEntry],
    ) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        let final_state = final_state.clone();
        let log = log.to_vec();
        Box::pin(async move {
            self.finish(&run_id, RunStatus::Completed, &final_state, &log, None)
        })
    }

    fn fail(
        &self,
        run_id: &RunId,
        last_state: &WorkflowState,
        log: &[LogEntry],
        failure: RunFailure,
    ) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        let last_state = last_state.clone();
        let log = log.to_vec();
        Box::pin(async move {
            self.finish(&run_id, RunStatus::Failed, &last_state, &log, Some(&failure))
        })
    }

    fn get(&self, run_id: &RunId) -> BoxFuture<'_, Result<RunRecord>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let row = conn
                .query_row(
                    "SELECT graph_id, status, state, failure, created_at, updated_at
                     FROM runs WHERE id = ?1",
                    params![run_id.0],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;

            let Some((graph_id, status, state, failure, created_at, updated_at)) = row else {
                return Err(ChainflowError::RunNotFound(run_id.0));
            };

            let mut stmt = conn
                .prepare("SELECT entry FROM run_log_entries WHERE run_id = ?1 ORDER BY seq ASC")
                .map_err(db_err)?;
            let log = stmt
                .query_map(params![run_id.0], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .map(|r| -> Result<LogEntry> {
                    let json = r.map_err(db_err)?;
                    Ok(serde_json::from_str::<LogEntry>(&json)?)
                })
                .collect::<Result<Vec<_>>>()?;

            let status = RunStatus::parse(&status)
                .ok_or_else(|| db_err(format!("unknown run status '{}'", status)))?;

            Ok(RunRecord {
                run_id,
                graph_id: GraphId(graph_id),
                status,
                final_state: serde_json::from_str(&state)?,
                log,
                failure: failure.map(|f| serde_json::from_str(&f)).transpose()?,
                created_at: parse_ts(&created_at)?,
                updated_at: parse_ts(&updated_at)?,
            })
        })
    }

    fn list_for_graph(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<Vec<RunId>>> {
        let graph_id = graph_id.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare("SELECT id FROM runs WHERE graph_id = ?1 ORDER BY seq ASC")
                .map_err(db_err)?;
            let ids = stmt
                .query_map(params![graph_id.0], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .map(|r| r.map(RunId).map_err(db_err))
                .collect::<Result<Vec<_>>>()?;
            Ok(ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainflow_core::types::FailureKind;

    fn chain() -> GraphDefinition {
        GraphDefinition::new("a")
            .with_node("a", "t")
            .with_node("b", "t")
            .with_edge("a", "b")
            .with_threshold(0.5)
    }

    #[tokio::test]
    async fn test_graph_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let id = store.create(chain()).await.unwrap();
        assert_eq!(GraphStore::get(&store, &id).await.unwrap(), chain());
        assert_eq!(store.list().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_invalid_graph_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        let mut bad = chain();
        bad.entry_node = "z".into();
        assert!(matches!(
            store.create(bad).await,
            Err(ChainflowError::InvalidGraph(_))
        ));
        assert!(matches!(
            GraphStore::get(&store, &GraphId::from_string("z")).await,
            Err(ChainflowError::GraphNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_progress_and_failure() {
        let store = SqliteStore::in_memory().unwrap();
        let graph_id = store.create(chain()).await.unwrap();
        let initial = WorkflowState::new().with("source_code", serde_json::json!("x"));
        let run_id = store.create_pending(&graph_id, &initial).await.unwrap();

        let entry = LogEntry::executed("a", initial.clone(), 2);
        store.append_log(&run_id, &entry).await.unwrap();
        let pending = RunStore::get(&store, &run_id).await.unwrap();
        assert_eq!(pending.status, RunStatus::Pending);
        assert_eq!(pending.log.len(), 1);

        let failed_entry = LogEntry::failed("b", initial.clone(), 0, "Tool not registered: t".into());
        store
            .fail(
                &run_id,
                &initial,
                &[entry, failed_entry],
                RunFailure {
                    kind: FailureKind::ToolNotRegistered,
                    message: "Tool not registered: t".into(),
                },
            )
            .await
            .unwrap();

        let record = RunStore::get(&store, &run_id).await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.log.len(), 2);
        assert_eq!(record.log[1].error.as_deref(), Some("Tool not registered: t"));
        assert_eq!(record.failure.unwrap().kind, FailureKind::ToolNotRegistered);
        assert_eq!(store.list_for_graph(&graph_id).await.unwrap(), vec![run_id]);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chainflow.db");

        let (graph_id, run_id) = {
            let store = SqliteStore::open(&path).unwrap();
            let graph_id = store.create(chain()).await.unwrap();
            let run_id = store
                .create_pending(&graph_id, &WorkflowState::new())
                .await
                .unwrap();
            let mut done = WorkflowState::new();
            done.done = true;
            done.quality_score = 0.9;
            store.complete(&run_id, &done, &[]).await.unwrap();
            (graph_id, run_id)
        };

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(GraphStore::get(&store, &graph_id).await.unwrap(), chain());
        let record = RunStore::get(&store, &run_id).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.final_state.quality_score, 0.9);
    }

    #[tokio::test]
    async fn test_complete_unknown_run() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(matches!(
            store
                .complete(&RunId::from_string("nope"), &WorkflowState::new(), &[])
                .await,
            Err(ChainflowError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_log_entries_keep_order_and_final_log_replaces_them() {
        let store = SqliteStore::in_memory().unwrap();
        let graph_id = store.create(chain()).await.unwrap();
        let run_id = store
            .create_pending(&graph_id, &WorkflowState::new())
            .await
            .unwrap();
        let other = store
            .create_pending(&graph_id, &WorkflowState::new())
            .await
            .unwrap();

        for i in 0..200 {
            let entry = LogEntry::executed(&format!("n{}", i), WorkflowState::new(), i);
            store.append_log(&run_id, &entry).await.unwrap();
        }
        store
            .append_log(&other, &LogEntry::executed("x", WorkflowState::new(), 1))
            .await
            .unwrap();

        let pending = RunStore::get(&store, &run_id).await.unwrap();
        assert_eq!(pending.log.len(), 200);
        assert!(pending
            .log
            .iter()
            .enumerate()
            .all(|(i, e)| e.node == format!("n{}", i)));
        assert_eq!(RunStore::get(&store, &other).await.unwrap().log.len(), 1);

        let last = LogEntry::executed("final", WorkflowState::new(), 3);
        store
            .complete(&run_id, &WorkflowState::new(), &[last])
            .await
            .unwrap();
        let record = RunStore::get(&store, &run_id).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.log.len(), 1);
        assert_eq!(record.log[0].node, "final");

        // Late progress for a finished run is dropped.
        store
            .append_log(&run_id, &LogEntry::executed("late", WorkflowState::new(), 0))
            .await
            .unwrap();
        assert_eq!(RunStore::get(&store, &run_id).await.unwrap().log.len(), 1);
        assert_eq!(RunStore::get(&store, &other).await.unwrap().log.len(), 1);
    }
}
