use futures::future::BoxFuture;

use crate::error::Result;
use crate::graph::GraphDefinition;
use crate::types::*;

/// One executable step of a workflow.
///
/// A tool takes ownership of the state and returns the state the next node
/// sees. It must not keep the instance it was given.
pub trait Tool: Send + Sync + 'static {
    /// Identifier nodes refer to.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Run the step.
    fn execute(&self, state: WorkflowState) -> BoxFuture<'_, Result<WorkflowState>>;

    /// Timeout in seconds for one invocation.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Graph repository: stores validated definitions by generated id.
pub trait GraphStore: Send + Sync + 'static {
    /// Validate and store a definition, returning its new id.
    fn create(&self, definition: GraphDefinition) -> BoxFuture<'_, Result<GraphId>>;

    /// Load a definition; `GraphNotFound` if absent.
    fn get(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<GraphDefinition>>;

    /// All stored graph ids, oldest first.
    fn list(&self) -> BoxFuture<'_, Result<Vec<GraphId>>>;
}

/// Run repository: pending, completed and failed runs by generated id.
pub trait RunStore: Send + Sync + 'static {
    /// Register a run before execution starts.
    fn create_pending(
        &self,
        graph_id: &GraphId,
        initial_state: &WorkflowState,
    ) -> BoxFuture<'_, Result<RunId>>;

    /// Append one log entry to a pending run.
    fn append_log(&self, run_id: &RunId, entry: &LogEntry) -> BoxFuture<'_, Result<()>>;

    /// Mark a run completed with its final state and full log.
    fn complete(
        &self,
        run_id: &RunId,
        final_state: &WorkflowState,
        log: &[LogEntry],
    ) -> BoxFuture<'_, Result<()>>;

    /// Mark a run failed, keeping the log accumulated up to the failure.
    fn fail(
        &self,
        run_id: &RunId,
        last_state: &WorkflowState,
        log: &[LogEntry],
        failure: RunFailure,
    ) -> BoxFuture<'_, Result<()>>;

    /// Load a run; `RunNotFound` if absent.
    fn get(&self, run_id: &RunId) -> BoxFuture<'_, Result<RunRecord>>;

    /// Runs of one graph, oldest first.
    fn list_for_graph(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<Vec<RunId>>>;
}
