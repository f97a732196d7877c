use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::debug;

use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::graph::GraphDefinition;
use chainflow_core::traits::{GraphStore, RunStore};
use chainflow_core::types::{
    GraphId, LogEntry, RunFailure, RunId, RunRecord, RunStatus, WorkflowState,
};

/// Graph repository held in process memory behind a single mutex.
pub struct InMemoryGraphStore {
    inner: Mutex<GraphTable>,
}

#[derive(Default)]
struct GraphTable {
    graphs: HashMap<GraphId, GraphDefinition>,
    order: Vec<GraphId>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GraphTable::default()),
        }
    }
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore for InMemoryGraphStore {
    fn create(&self, definition: GraphDefinition) -> BoxFuture<'_, Result<GraphId>> {
        Box::pin(async move {
            definition.validate()?;
            let graph_id = GraphId::new();
            let mut table = self
                .inner
                .lock()
                .map_err(|e| ChainflowError::Database(e.to_string()))?;
            table.graphs.insert(graph_id.clone(), definition);
            table.order.push(graph_id.clone());
            debug!(graph_id = %graph_id, "Graph stored");
            Ok(graph_id)
        })
    }

    fn get(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<GraphDefinition>> {
        let graph_id = graph_id.clone();
        Box::pin(async move {
            let table = self
                .inner
                .lock()
                .map_err(|e| ChainflowError::Database(e.to_string()))?;
            table
                .graphs
                .get(&graph_id)
                .cloned()
                .ok_or(ChainflowError::GraphNotFound(graph_id.0))
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<GraphId>>> {
        Box::pin(async move {
            let table = self
                .inner
                .lock()
                .map_err(|e| ChainflowError::Database(e.to_string()))?;
            Ok(table.order.clone())
        })
    }
}

/// Run repository held in process memory behind a single mutex.
pub struct InMemoryRunStore {
    inner: Mutex<RunTable>,
}

#[derive(Default)]
struct RunTable {
    runs: HashMap<RunId, RunRecord>,
    order: Vec<RunId>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RunTable::default()),
        }
    }

    fn update<F>(&self, run_id: &RunId, f: F) -> Result<()>
    where
        F: FnOnce(&mut RunRecord),
    {
        let mut table = self
            .inner
            .lock()
            .map_err(|e| ChainflowError::Database(e.to_string()))?;
        let record = table
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ChainflowError::RunNotFound(run_id.0.clone()))?;
        f(record);
        record.updated_at = Utc::now();
        Ok(())
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStore for InMemoryRunStore {
    fn create_pending(
        &self,
        graph_id: &GraphId,
        initial_state: &WorkflowState,
    ) -> BoxFuture<'_, Result<RunId>> {
        let now = Utc::now();
        let record = RunRecord {
            run_id: RunId::new(),
            graph_id: graph_id.clone(),
            status: RunStatus::Pending,
            final_state: initial_state.clone(),
            log: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
        };

        Box::pin(async move {
            let run_id = record.run_id.clone();
            let mut table = self
                .inner
                .lock()
                .map_err(|e| ChainflowError::Database(e.to_string()))?;
            table.order.push(run_id.clone());
            table.runs.insert(run_id.clone(), record);
            Ok(run_id)
        })
    }

    fn append_log(&self, run_id: &RunId, entry: &LogEntry) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        let entry = entry.clone();
        Box::pin(async move {
            self.update(&run_id, |record| {
                if record.status == RunStatus::Pending {
                    record.log.push(entry);
                }
            })
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
            self.update(&run_id, |record| {
                record.status = RunStatus::Completed;
                record.final_state = final_state;
                record.log = log;
                record.failure = None;
            })
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
            self.update(&run_id, |record| {
                record.status = RunStatus::Failed;
                record.final_state = last_state;
                record.log = log;
                record.failure = Some(failure);
            })
        })
    }

    fn get(&self, run_id: &RunId) -> BoxFuture<'_, Result<RunRecord>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let table = self
                .inner
                .lock()
                .map_err(|e| ChainflowError::Database(e.to_string()))?;
            table
                .runs
                .get(&run_id)
                .cloned()
                .ok_or(ChainflowError::RunNotFound(run_id.0))
        })
    }

    fn list_for_graph(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<Vec<RunId>>> {
        let graph_id = graph_id.clone();
        Box::pin(async move {
            let table = self
                .inner
                .lock()
                .map_err(|e| ChainflowError::Database(e.to_string()))?;
            Ok(table
                .order
                .iter()
                .filter(|id| {
                    table
                        .runs
                        .get(*id)
                        .is_some_and(|r| r.graph_id == graph_id)
                })
                .cloned()
                .collect())
        })
    }
}
