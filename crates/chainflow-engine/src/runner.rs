use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chainflow_core::config::EngineConfig;
use chainflow_core::error::Result;
use chainflow_core::event::EventBus;
use chainflow_core::graph::GraphDefinition;
use chainflow_core::traits::{GraphStore, RunStore};
use chainflow_core::types::{
    FailureKind, GraphId, LogEntry, RunFailure, RunId, RunRecord, WorkflowState,
};
use chainflow_tools::builtin::code_review::default_review_graph;
use chainflow_tools::ToolRegistry;

use crate::graph::executor::THRESHOLD_KEY;
use crate::graph::{GraphExecutor, RunOptions};

/// Owns the repositories and drives runs through the executor.
///
/// Both run modes share one code path: a pending record is created, the
/// traversal runs, and the outcome is written back. `run_sync` awaits that
/// path; `run_async` spawns it and hands back the run id for polling.
pub struct RunManager {
    graphs: Arc<dyn GraphStore>,
    driver: RunDriver,
    review_graph: tokio::sync::Mutex<Option<GraphId>>,
    max_steps: usize,
    default_threshold: f64,
}

/// The parts of the manager a background run needs.
#[derive(Clone)]
struct RunDriver {
    runs: Arc<dyn RunStore>,
    executor: Arc<GraphExecutor>,
    event_bus: Arc<EventBus>,
    active: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
}

impl RunManager {
    pub fn new(
        graphs: Arc<dyn GraphStore>,
        runs: Arc<dyn RunStore>,
        registry: Arc<ToolRegistry>,
        config: &EngineConfig,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_capacity));
        let executor = Arc::new(GraphExecutor::new(registry).with_event_bus(event_bus.clone()));
        Self {
            graphs,
            driver: RunDriver {
                runs,
                executor,
                event_bus,
                active: Arc::new(Mutex::new(HashMap::new())),
            },
            review_graph: tokio::sync::Mutex::new(None),
            max_steps: config.max_steps,
            default_threshold: config.default_threshold,
        }
    }

    /// Bus carrying the events of every run this manager drives.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.driver.event_bus
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.driver.executor.registry()
    }

    /// Validate and store a definition.
    pub async fn create_graph(&self, definition: GraphDefinition) -> Result<GraphId> {
        let graph_id = self.graphs.create(definition).await?;
        info!(graph_id = %graph_id, "Graph created");
        Ok(graph_id)
    }

    pub async fn get_graph(&self, graph_id: &GraphId) -> Result<GraphDefinition> {
        self.graphs.get(graph_id).await
    }

    pub async fn list_graphs(&self) -> Result<Vec<GraphId>> {
        self.graphs.list().await
    }

    /// Run a stored graph and wait for the outcome.
    ///
    /// Execution failures are not errors here: they come back as a record
    /// with status `failed`. `Err` means the graph was missing or storage
    /// failed.
    pub async fn run_sync(
        &self,
        graph_id: &GraphId,
        initial_state: WorkflowState,
        max_steps: Option<usize>,
    ) -> Result<RunRecord> {
        let definition = self.graphs.get(graph_id).await?;
        let run_id = self.driver.runs.create_pending(graph_id, &initial_state).await?;
        let cancel = self.driver.track(&run_id);

        self.driver
            .drive(
                run_id.clone(),
                definition,
                initial_state,
                max_steps.unwrap_or(self.max_steps),
                cancel,
            )
            .await?;

        self.driver.runs.get(&run_id).await
    }

    /// Register a pending run and execute it in the background.
    pub async fn run_async(
        &self,
        graph_id: &GraphId,
        initial_state: WorkflowState,
        max_steps: Option<usize>,
    ) -> Result<RunId> {
        let definition = self.graphs.get(graph_id).await?;
        let run_id = self.driver.runs.create_pending(graph_id, &initial_state).await?;
        let cancel = self.driver.track(&run_id);
        let max_steps = max_steps.unwrap_or(self.max_steps);

        let driver = self.driver.clone();
        let task_run_id = run_id.clone();
        let fallback_state = initial_state.clone();
        let handle = tokio::spawn(async move {
            driver
                .drive(task_run_id, definition, initial_state, max_steps, cancel)
                .await
        });

        // Watch the run task so a crash still leaves a terminal record.
        let driver = self.driver.clone();
        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(run_id = %task_run_id, error = %e, "Background run could not be stored");
                }
                Err(e) => {
                    error!(run_id = %task_run_id, error = %e, "Background run task aborted");
                    driver.abandon(&task_run_id, &fallback_state, e.to_string()).await;
                }
            }
        });

        info!(run_id = %run_id, graph_id = %graph_id, "Run started in background");
        Ok(run_id)
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<RunRecord> {
        self.driver.runs.get(run_id).await
    }

    pub async fn list_runs(&self, graph_id: &GraphId) -> Result<Vec<RunId>> {
        self.driver.runs.list_for_graph(graph_id).await
    }

    /// Poll a run until it leaves `pending`.
    pub async fn wait_for(&self, run_id: &RunId, poll_interval: Duration) -> Result<RunRecord> {
        loop {
            let record = self.driver.runs.get(run_id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Ask a running run to stop before its next node.
    ///
    /// Returns false when the run is unknown or already finished.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        let active = self
            .driver
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match active.get(run_id) {
            Some(token) => {
                token.cancel();
                info!(run_id = %run_id, "Run cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Run the built-in review chain over `source`.
    ///
    /// The review graph is stored on first use and reused afterwards; a
    /// per-call threshold travels in the initial state.
    pub async fn review(&self, source: &str, threshold: Option<f64>) -> Result<RunRecord> {
        let graph_id = self.review_graph_id().await?;
        let threshold = threshold.unwrap_or(self.default_threshold);
        let initial = WorkflowState::new()
            .with("source_code", serde_json::json!(source))
            .with(THRESHOLD_KEY, serde_json::json!(threshold));
        self.run_sync(&graph_id, initial, None).await
    }

    async fn review_graph_id(&self) -> Result<GraphId> {
        let mut cached = self.review_graph.lock().await;
        if let Some(graph_id) = cached.as_ref() {
            return Ok(graph_id.clone());
        }
        let graph_id = self
            .create_graph(default_review_graph(self.default_threshold))
            .await?;
        *cached = Some(graph_id.clone());
        Ok(graph_id)
    }
}

impl RunDriver {
    fn track(&self, run_id: &RunId) -> CancellationToken {
        let token = CancellationToken::new();
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), token.clone());
        token
    }

    fn untrack(&self, run_id: &RunId) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
    }

    /// Execute one run and persist its outcome.
    async fn drive(
        &self,
        run_id: RunId,
        definition: GraphDefinition,
        initial_state: WorkflowState,
        max_steps: usize,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = RunOptions::new(max_steps)
            .with_run_id(run_id.clone())
            .with_cancel(cancel)
            .with_progress(tx);

        let progress = self.spawn_progress(run_id.clone(), rx);
        let outcome = self
            .executor
            .execute_with(&definition, initial_state, &options)
            .await;

        // Dropping the sender ends the forwarder once it has drained; wait for
        // it so no append lands after the final write.
        drop(options);
        if let Err(e) = progress.await {
            warn!(run_id = %run_id, error = %e, "Progress forwarder ended abnormally");
        }

        let stored = match outcome {
            Ok(result) => {
                self.runs
                    .complete(&run_id, &result.state, &result.log)
                    .await
            }
            Err(failure) => {
                warn!(run_id = %run_id, error = %failure, "Run failed");
                self.runs
                    .fail(&run_id, &failure.state, &failure.log, failure.failure())
                    .await
            }
        };
        self.untrack(&run_id);
        stored
    }

    /// Persist node entries of `run_id` while it is pending.
    fn spawn_progress(
        &self,
        run_id: RunId,
        mut rx: mpsc::UnboundedReceiver<LogEntry>,
    ) -> JoinHandle<()> {
        let runs = self.runs.clone();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = runs.append_log(&run_id, &entry).await {
                    warn!(run_id = %run_id, error = %e, "Failed to append progress");
                }
            }
            debug!(run_id = %run_id, "Progress forwarder finished");
        })
    }

    /// Store a run whose task died before writing its outcome.
    async fn abandon(&self, run_id: &RunId, last_state: &WorkflowState, reason: String) {
        let log = match self.runs.get(run_id).await {
            Ok(record) => record.log,
            Err(_) => Vec::new(),
        };
        let failure = RunFailure {
            kind: FailureKind::Other,
            message: format!("run task aborted: {}", reason),
        };
        if let Err(e) = self.runs.fail(run_id, last_state, &log, failure).await {
            error!(run_id = %run_id, error = %e, "Failed to store aborted run");
        }
        self.untrack(run_id);
    }
}
