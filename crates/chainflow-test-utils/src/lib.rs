//! Fixtures shared by the Chainflow test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::graph::GraphDefinition;
use chainflow_core::traits::Tool;
use chainflow_core::types::WorkflowState;

/// Key under which `VisitTool` records node visits.
pub const VISITED_KEY: &str = "visited";

/// Appends its own name to `data.visited` and counts invocations.
pub struct VisitTool {
    name: String,
    calls: Arc<AtomicUsize>,
}

impl VisitTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared invocation counter, readable after the tool is registered.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Tool for VisitTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, mut state: WorkflowState) -> BoxFuture<'_, Result<WorkflowState>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut visited = state.get_str_list(VISITED_KEY);
            visited.push(self.name.clone());
            state.set(VISITED_KEY, serde_json::json!(visited));
            Ok(state)
        })
    }
}

/// Records a visit and sets `done`.
pub struct FinishTool {
    name: String,
}

impl FinishTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Tool for FinishTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, mut state: WorkflowState) -> BoxFuture<'_, Result<WorkflowState>> {
        Box::pin(async move {
            let mut visited = state.get_str_list(VISITED_KEY);
            visited.push(self.name.clone());
            state.set(VISITED_KEY, serde_json::json!(visited));
            state.done = true;
            Ok(state)
        })
    }
}

/// Always fails with the given message.
pub struct FailingTool {
    name: String,
    message: String,
}

impl FailingTool {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _state: WorkflowState) -> BoxFuture<'_, Result<WorkflowState>> {
        Box::pin(async move {
            Err(ChainflowError::step("", self.name.clone(), self.message.clone()))
        })
    }
}

/// Panics inside its step future.
pub struct PanickingTool {
    name: String,
}

impl PanickingTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Tool for PanickingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _state: WorkflowState) -> BoxFuture<'_, Result<WorkflowState>> {
        Box::pin(async move { blow_up(&self.name) })
    }
}

fn blow_up(name: &str) -> Result<WorkflowState> {
    panic!("{} blew up", name)
}

/// Sleeps before passing the state through unchanged.
pub struct SlowTool {
    name: String,
    delay: Duration,
    timeout_secs: u64,
}

impl SlowTool {
    pub fn new(name: impl Into<String>, delay: Duration, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            delay,
            timeout_secs,
        }
    }
}

impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, state: WorkflowState) -> BoxFuture<'_, Result<WorkflowState>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(state)
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}

/// `n0 -> n1 -> ... -> n{len-1}`, every node bound to `tool`.
pub fn linear_chain(len: usize, tool: &str) -> GraphDefinition {
    let mut def = GraphDefinition::new("n0");
    for i in 0..len {
        def = def.with_node(format!("n{}", i), tool);
        if i + 1 < len {
            def = def.with_edge(format!("n{}", i), format!("n{}", i + 1));
        }
    }
    def
}

/// Node names `n0..n{len-1}` in chain order.
pub fn chain_names(len: usize) -> Vec<String> {
    (0..len).map(|i| format!("n{}", i)).collect()
}

/// Python-like source with one debug print and one TODO.
pub const SAMPLE_SOURCE: &str = "\
def add(a, b):
    # TODO: validate inputs
    print(a, b)
    return a + b
";
