use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use tracing::debug;

use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::traits::Tool;
use chainflow_core::types::WorkflowState;

/// Registry of available tools, keyed by identifier.
///
/// Lookups take a read lock, so concurrent runs can resolve tools while a
/// late registration waits for the write lock.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    default_timeout_secs: u64,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            default_timeout_secs: 30,
        }
    }

    /// Timeout given to tools registered through `register_fn`.
    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    /// Register a tool, replacing any tool with the same identifier.
    pub fn register(&self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let replaced = self
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), tool)
            .is_some();
        debug!(tool = %name, replaced, "Tool registered");
    }

    /// Register an async closure as a tool.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkflowState>> + Send + 'static,
    {
        self.register(FnTool::new(name, f).with_timeout(self.default_timeout_secs));
    }

    /// Look up a tool; `ToolNotRegistered` if absent.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ChainflowError::ToolNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered identifiers with descriptions, sorted by identifier.
    pub fn list(&self) -> Vec<(String, String)> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(String, String)> = tools
            .values()
            .map(|t| (t.name().to_string(), t.description().to_string()))
            .collect();
        entries.sort();
        entries
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a registry with the built-in code-review tools registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::builtin::code_review::register_all(&registry);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A tool backed by an async closure.
pub struct FnTool<F> {
    name: String,
    description: String,
    timeout_secs: u64,
    f: F,
}

impl<F> FnTool<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            timeout_secs: 30,
            f,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkflowState>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn execute(&self, state: WorkflowState) -> BoxFuture<'_, Result<WorkflowState>> {
        Box::pin((self.f)(state))
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_fn_and_resolve() {
        let registry = ToolRegistry::new().with_default_timeout(5);
        registry.register_fn("mark", |mut state: WorkflowState| async move {
            state.set_str("marked", "yes");
            Ok(state)
        });

        let tool = registry.resolve("mark").unwrap();
        assert_eq!(tool.timeout_secs(), 5);
        let out = tool.execute(WorkflowState::new()).await.unwrap();
        assert_eq!(out.get_str("marked"), Some("yes"));
    }

    #[test]
    fn test_resolve_missing() {
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.resolve("nope"),
            Err(ChainflowError::ToolNotRegistered(name)) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn test_register_replaces() {
        let registry = ToolRegistry::new();
        registry.register_fn("t", |mut s: WorkflowState| async move {
            s.set_str("v", "first");
            Ok(s)
        });
        registry.register_fn("t", |mut s: WorkflowState| async move {
            s.set_str("v", "second");
            Ok(s)
        });
        assert_eq!(registry.len(), 1);
        let out = registry
            .resolve("t")
            .unwrap()
            .execute(WorkflowState::new())
            .await
            .unwrap();
        assert_eq!(out.get_str("v"), Some("second"));
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        for name in [
            "extract_functions",
            "check_complexity",
            "detect_issues",
            "suggest_improvements",
            "evaluate_quality",
        ] {
            assert!(registry.contains(name), "missing {}", name);
        }
        let names: Vec<String> = registry.list().into_iter().map(|(n, _)| n).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[tokio::test]
    async fn test_concurrent_resolve() {
        let registry = Arc::new(ToolRegistry::with_builtins());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.resolve("detect_issues").map(|t| t.name().to_string())
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "detect_issues");
        }
    }
}
