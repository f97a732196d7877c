use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ChainflowError, Result};

/// An immutable description of a chain of named steps.
///
/// `nodes` maps a node name to the tool identifier it dispatches to, and
/// `edges` maps a node name to its single successor. A node without an edge
/// ends the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub nodes: BTreeMap<String, String>,
    #[serde(default)]
    pub edges: BTreeMap<String, String>,
    pub entry_node: String,
    /// Handed to steps as `data.quality_threshold`; never read by the engine.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    0.8
}

impl GraphDefinition {
    /// Start an empty definition with the given entry node.
    pub fn new(entry_node: impl Into<String>) -> Self {
        Self {
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            entry_node: entry_node.into(),
            threshold: default_threshold(),
        }
    }

    /// Declare a node bound to a tool identifier.
    pub fn with_node(mut self, name: impl Into<String>, tool: impl Into<String>) -> Self {
        self.nodes.insert(name.into(), tool.into());
        self
    }

    /// Set the successor of `from`.
    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.insert(from.into(), to.into());
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Tool identifier assigned to `node`.
    pub fn tool_for(&self, node: &str) -> Option<&str> {
        self.nodes.get(node).map(String::as_str)
    }

    /// Successor of `node`, if the chain continues.
    pub fn successor(&self, node: &str) -> Option<&str> {
        self.edges.get(node).map(String::as_str)
    }

    /// Structural validation: the entry node and every edge endpoint must be
    /// declared nodes. Tool identifiers are resolved later, at dispatch.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ChainflowError::InvalidGraph(
                "graph declares no nodes".to_string(),
            ));
        }

        if !self.nodes.contains_key(&self.entry_node) {
            return Err(ChainflowError::InvalidGraph(format!(
                "entry node '{}' is not a declared node",
                self.entry_node
            )));
        }

        for (from, to) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(ChainflowError::InvalidGraph(format!(
                    "edge source '{}' is not a declared node",
                    from
                )));
            }
            if !self.nodes.contains_key(to) {
                return Err(ChainflowError::InvalidGraph(format!(
                    "edge '{}' -> '{}' targets an undeclared node",
                    from, to
                )));
            }
        }

        if !self.threshold.is_finite() {
            return Err(ChainflowError::InvalidGraph(
                "threshold must be a finite number".to_string(),
            ));
        }

        Ok(())
    }
}
