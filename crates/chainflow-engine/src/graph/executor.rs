use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chainflow_core::error::ChainflowError;
use chainflow_core::event::EventBus;
use chainflow_core::graph::GraphDefinition;
use chainflow_core::types::{LogEntry, RunEvent, RunFailure, RunId, WorkflowState};
use chainflow_tools::ToolRegistry;

/// Key under which the graph threshold is handed to steps.
pub const THRESHOLD_KEY: &str = "quality_threshold";

/// Result of a traversal that reached a stopping point.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// State returned by the last executed step.
    pub state: WorkflowState,
    /// One entry per executed node, in visitation order.
    pub log: Vec<LogEntry>,
    /// Total execution time in milliseconds.
    pub total_elapsed_ms: u64,
}

impl ExecutionResult {
    /// Node names in visitation order.
    pub fn visited(&self) -> Vec<&str> {
        self.log.iter().map(|e| e.node.as_str()).collect()
    }
}

/// An aborted traversal.
///
/// `state` is the last state a step returned successfully (or the initial
/// state), never partial output of the failing step. `log` includes the
/// entry recording the failure when a node was being dispatched.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ExecutionFailure {
    #[source]
    pub error: ChainflowError,
    pub state: WorkflowState,
    pub log: Vec<LogEntry>,
}

impl ExecutionFailure {
    /// Persistable classification of this failure.
    pub fn failure(&self) -> RunFailure {
        RunFailure {
            kind: self.error.failure_kind(),
            message: self.error.to_string(),
        }
    }
}

/// Per-run parameters.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_id: RunId,
    /// Ceiling on executed nodes; reaching it fails the run.
    pub max_steps: usize,
    /// Checked before each node is dispatched.
    pub cancel: CancellationToken,
    /// Receives every log entry as it is recorded.
    pub progress: Option<mpsc::UnboundedSender<LogEntry>>,
}

impl RunOptions {
    pub fn new(max_steps: usize) -> Self {
        Self {
            run_id: RunId::new(),
            max_steps,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Stream log entries to `tx`; the channel closes when the options drop.
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<LogEntry>) -> Self {
        self.progress = Some(tx);
        self
    }

    fn report(&self, entry: &LogEntry) {
        if let Some(tx) = &self.progress {
            // Receiver gone means nobody is watching
            let _ = tx.send(entry.clone());
        }
    }
}

/// Executes graph definitions against a tool registry.
///
/// The executor holds no per-run state; concurrent `execute` calls are
/// independent. Nodes of one run execute strictly one after another.
pub struct GraphExecutor {
    registry: Arc<ToolRegistry>,
    event_bus: Option<Arc<EventBus>>,
}

impl GraphExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            event_bus: None,
        }
    }

    /// Publish run progress on the given bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run `definition` from its entry node with a fresh run id.
    pub async fn execute(
        &self,
        definition: &GraphDefinition,
        initial_state: WorkflowState,
        max_steps: usize,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        self.execute_with(definition, initial_state, &RunOptions::new(max_steps))
            .await
    }

    /// Run `definition` from its entry node.
    pub async fn execute_with(
        &self,
        definition: &GraphDefinition,
        initial_state: WorkflowState,
        options: &RunOptions,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        let run_id = &options.run_id;
        let start = Instant::now();
        let mut state = initial_state;
        let mut log: Vec<LogEntry> = Vec::new();
        let mut current = definition.entry_node.clone();
        let mut steps = 0usize;

        // The caller's threshold wins over the graph's.
        state
            .data
            .entry(THRESHOLD_KEY.to_string())
            .or_insert_with(|| serde_json::json!(definition.threshold));

        info!(run_id = %run_id, entry = %current, max_steps = options.max_steps, "Run started");
        self.publish(RunEvent::RunStarted {
            run_id: run_id.clone(),
            entry_node: current.clone(),
        });

        loop {
            if steps >= options.max_steps {
                warn!(run_id = %run_id, node = %current, steps, "Step limit reached");
                return Err(self.abort(
                    run_id,
                    ChainflowError::LoopLimitExceeded(options.max_steps),
                    state,
                    log,
                ));
            }

            if options.cancel.is_cancelled() {
                info!(run_id = %run_id, node = %current, "Run cancelled before node");
                return Err(self.abort(run_id, ChainflowError::Cancelled, state, log));
            }

            let tool_name = match definition.tool_for(&current) {
                Some(t) => t.to_string(),
                None => {
                    let err = ChainflowError::InvalidGraph(format!(
                        "node '{}' is not declared",
                        current
                    ));
                    self.record_failure(options, &mut log, &current, &state, 0, &err);
                    return Err(self.abort(run_id, err, state, log));
                }
            };

            let tool = match self.registry.resolve(&tool_name) {
                Ok(tool) => tool,
                Err(err) => {
                    error!(run_id = %run_id, node = %current, tool = %tool_name, "Tool not registered");
                    self.record_failure(options, &mut log, &current, &state, 0, &err);
                    return Err(self.abort(run_id, err, state, log));
                }
            };

            debug!(run_id = %run_id, node = %current, tool = %tool_name, "Executing node");
            self.publish(RunEvent::NodeStarted {
                run_id: run_id.clone(),
                node: current.clone(),
                tool: tool_name.clone(),
            });

            let node_start = Instant::now();
            let timeout_secs = tool.timeout_secs();
            // A panicking step is a step fault like any other.
            let step = AssertUnwindSafe(async { tool.execute(state.clone()).await }).catch_unwind();
            let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), step).await;
            let elapsed_ms = node_start.elapsed().as_millis() as u64;

            let next_state = match outcome {
                Ok(Ok(Ok(next))) => next,
                Ok(Err(panic)) => {
                    let err = ChainflowError::step(
                        current.clone(),
                        tool_name.clone(),
                        format!("step panicked: {}", panic_message(panic.as_ref())),
                    );
                    error!(run_id = %run_id, node = %current, error = %err, "Node panicked");
                    self.record_failure(options, &mut log, &current, &state, elapsed_ms, &err);
                    return Err(self.abort(run_id, err, state, log));
                }
                Ok(Ok(Err(e))) => {
                    let message = match e {
                        ChainflowError::Execution { message, .. } => message,
                        other => other.to_string(),
                    };
                    let err = ChainflowError::step(current.clone(), tool_name.clone(), message);
                    error!(run_id = %run_id, node = %current, error = %err, "Node failed");
                    self.record_failure(options, &mut log, &current, &state, elapsed_ms, &err);
                    return Err(self.abort(run_id, err, state, log));
                }
                Err(_) => {
                    let err = ChainflowError::StepTimeout {
                        node: current.clone(),
                        tool: tool_name.clone(),
                        timeout_secs,
                    };
                    error!(run_id = %run_id, node = %current, timeout_secs, "Node timed out");
                    self.record_failure(options, &mut log, &current, &state, elapsed_ms, &err);
                    return Err(self.abort(run_id, err, state, log));
                }
            };

            state = next_state;
            let entry = LogEntry::executed(&current, state.clone(), elapsed_ms);
            options.report(&entry);
            self.publish(RunEvent::NodeCompleted {
                run_id: run_id.clone(),
                entry: entry.clone(),
            });
            log.push(entry);

            debug!(run_id = %run_id, node = %current, elapsed_ms, done = state.done, "Node complete");

            if state.done {
                debug!(run_id = %run_id, node = %current, "State marked done, stopping");
                break;
            }

            match definition.successor(&current) {
                Some(next) => {
                    current = next.to_string();
                    steps += 1;
                }
                None => {
                    debug!(run_id = %run_id, node = %current, "No outgoing edge, chain complete");
                    break;
                }
            }
        }

        let total_elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %run_id,
            nodes = log.len(),
            quality_score = state.quality_score,
            done = state.done,
            total_elapsed_ms,
            "Run complete"
        );
        self.publish(RunEvent::RunCompleted {
            run_id: run_id.clone(),
            steps: log.len(),
            quality_score: state.quality_score,
        });

        Ok(ExecutionResult {
            state,
            log,
            total_elapsed_ms,
        })
    }

    fn record_failure(
        &self,
        options: &RunOptions,
        log: &mut Vec<LogEntry>,
        node: &str,
        state: &WorkflowState,
        elapsed_ms: u64,
        err: &ChainflowError,
    ) {
        let entry = LogEntry::failed(node, state.clone(), elapsed_ms, err.to_string());
        options.report(&entry);
        self.publish(RunEvent::NodeFailed {
            run_id: options.run_id.clone(),
            entry: entry.clone(),
        });
        log.push(entry);
    }

    fn abort(
        &self,
        run_id: &RunId,
        error: ChainflowError,
        state: WorkflowState,
        log: Vec<LogEntry>,
    ) -> ExecutionFailure {
        let failure = ExecutionFailure { error, state, log };
        self.publish(RunEvent::RunFailed {
            run_id: run_id.clone(),
            failure: failure.failure(),
        });
        failure
    }

    fn publish(&self, event: RunEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainflow_core::types::FailureKind;
    use chainflow_test_utils::{
        chain_names, linear_chain, FailingTool, FinishTool, PanickingTool, SlowTool, VisitTool,
        VISITED_KEY,
    };
    use std::sync::atomic::Ordering;

    fn registry() -> Arc<ToolRegistry> {
        let registry = ToolRegistry::new();
        registry.register(VisitTool::new("visit"));
        registry.register(FinishTool::new("finish"));
        registry.register(FailingTool::new("explode", "kaboom"));
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_linear_chain_visits_all_nodes_in_order() {
        let executor = GraphExecutor::new(registry());
        let def = linear_chain(5, "visit");

        let result = executor
            .execute(&def, WorkflowState::new(), 100)
            .await
            .unwrap();

        let expected = chain_names(5);
        assert_eq!(result.visited(), expected);
        assert_eq!(result.log.len(), 5);
        assert_eq!(result.state.get_str_list(VISITED_KEY).len(), 5);
        assert!(!result.state.done);
    }

    #[tokio::test]
    async fn test_done_stops_despite_outgoing_edge() {
        let executor = GraphExecutor::new(registry());
        let def = linear_chain(5, "visit").with_node("n2", "finish");

        let result = executor
            .execute(&def, WorkflowState::new(), 100)
            .await
            .unwrap();

        assert_eq!(result.visited(), vec!["n0", "n1", "n2"]);
        assert!(result.state.done);
    }

    #[tokio::test]
    async fn test_cycle_hits_step_limit() {
        let executor = GraphExecutor::new(registry());
        let def = linear_chain(3, "visit").with_edge("n2", "n0");

        let failure = executor
            .execute(&def, WorkflowState::new(), 10)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ChainflowError::LoopLimitExceeded(10)));
        assert_eq!(failure.failure().kind, FailureKind::LoopLimitExceeded);
        assert_eq!(failure.log.len(), 10);
        assert_eq!(failure.state.get_str_list(VISITED_KEY).len(), 10);
    }

    #[tokio::test]
    async fn test_unregistered_tool_aborts_with_log() {
        let executor = GraphExecutor::new(registry());
        let def = linear_chain(3, "visit").with_node("n1", "missing_tool");

        let failure = executor
            .execute(&def, WorkflowState::new(), 100)
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            ChainflowError::ToolNotRegistered(ref t) if t == "missing_tool"
        ));
        assert_eq!(failure.log.len(), 2);
        assert_eq!(failure.log[0].node, "n0");
        assert!(failure.log[1].is_error());
        assert_eq!(failure.log[1].node, "n1");
        assert_eq!(failure.state.get_str_list(VISITED_KEY).len(), 1);
    }

    #[tokio::test]
    async fn test_step_error_becomes_execution_error() {
        let executor = GraphExecutor::new(registry());
        let def = linear_chain(3, "visit").with_node("n1", "explode");

        let failure = executor
            .execute(&def, WorkflowState::new(), 100)
            .await
            .unwrap_err();

        match &failure.error {
            ChainflowError::Execution {
                node,
                tool,
                message,
            } => {
                assert_eq!(node, "n1");
                assert_eq!(tool, "explode");
                assert_eq!(message, "kaboom");
            }
            other => panic!("unexpected error: {other}"),
        }
        let last = failure.log.last().unwrap();
        assert_eq!(last.error.as_deref(), Some(failure.error.to_string().as_str()));
        // No partial output from the failing step
        assert_eq!(failure.state.get_str_list(VISITED_KEY).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        let registry = ToolRegistry::new();
        registry.register(SlowTool::new("slow", Duration::from_secs(10), 1));
        let executor = GraphExecutor::new(Arc::new(registry));
        let def = GraphDefinition::new("only").with_node("only", "slow");

        let failure = executor
            .execute(&def, WorkflowState::new(), 5)
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            ChainflowError::StepTimeout { timeout_secs: 1, .. }
        ));
        assert_eq!(failure.failure().kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_node() {
        let visit = VisitTool::new("visit");
        let calls = visit.counter();
        let registry = ToolRegistry::new();
        registry.register(visit);
        let executor = GraphExecutor::new(Arc::new(registry));

        let options = RunOptions::new(10);
        options.cancel.cancel();
        let failure = executor
            .execute_with(&linear_chain(2, "visit"), WorkflowState::new(), &options)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ChainflowError::Cancelled));
        assert!(failure.log.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_threshold_injected_unless_present() {
        let executor = GraphExecutor::new(registry());
        let def = linear_chain(1, "visit").with_threshold(0.65);

        let result = executor
            .execute(&def, WorkflowState::new(), 10)
            .await
            .unwrap();
        assert_eq!(result.state.get_f64(THRESHOLD_KEY), Some(0.65));

        let initial = WorkflowState::new().with(THRESHOLD_KEY, serde_json::json!(0.3));
        let result = executor.execute(&def, initial, 10).await.unwrap();
        assert_eq!(result.state.get_f64(THRESHOLD_KEY), Some(0.3));
    }

    #[tokio::test]
    async fn test_repeated_runs_are_identical() {
        let executor = GraphExecutor::new(registry());
        let def = linear_chain(4, "visit");
        let initial = WorkflowState::new().with("seed", serde_json::json!(7));

        let a = executor.execute(&def, initial.clone(), 10).await.unwrap();
        let b = executor.execute(&def, initial, 10).await.unwrap();

        assert_eq!(a.state, b.state);
        assert_eq!(a.visited(), b.visited());
        for (x, y) in a.log.iter().zip(&b.log) {
            assert_eq!(x.state_snapshot, y.state_snapshot);
            assert_eq!(x.message, y.message);
        }
    }

    #[tokio::test]
    async fn test_events_published_in_order() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let executor = GraphExecutor::new(registry()).with_event_bus(bus);

        executor
            .execute(&linear_chain(2, "visit"), WorkflowState::new(), 10)
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].clone());
        }
        assert_eq!(
            kinds,
            vec![
                "run_started",
                "node_started",
                "node_completed",
                "node_started",
                "node_completed",
                "run_completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_step_becomes_execution_error() {
        let registry = ToolRegistry::new();
        registry.register(VisitTool::new("visit"));
        registry.register(PanickingTool::new("boom"));
        let executor = GraphExecutor::new(Arc::new(registry));
        let def = linear_chain(3, "visit").with_node("n1", "boom");

        let failure = executor
            .execute(&def, WorkflowState::new(), 10)
            .await
            .unwrap_err();

        match &failure.error {
            ChainflowError::Execution { node, message, .. } => {
                assert_eq!(node, "n1");
                assert!(message.contains("boom blew up"), "message was {message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(failure.failure().kind, FailureKind::Execution);
        assert_eq!(failure.log.len(), 2);
        assert!(failure.log[1].is_error());
        assert_eq!(failure.state.get_str_list(VISITED_KEY).len(), 1);
    }

    #[tokio::test]
    async fn test_progress_channel_receives_every_entry() {
        let executor = GraphExecutor::new(registry());
        let def = linear_chain(3, "visit").with_node("n2", "explode");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = RunOptions::new(10).with_progress(tx);

        let failure = executor
            .execute_with(&def, WorkflowState::new(), &options)
            .await
            .unwrap_err();
        drop(options);

        let mut streamed = Vec::new();
        while let Some(entry) = rx.recv().await {
            streamed.push(entry);
        }
        assert_eq!(streamed.len(), failure.log.len());
        assert_eq!(streamed[0].node, "n0");
        assert!(streamed[2].is_error());
    }
}
