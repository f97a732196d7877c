use thiserror::Error;

use crate::types::FailureKind;

#[derive(Debug, Error)]
pub enum ChainflowError {
    // Graph errors
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run exceeded step limit ({0}), edges probably form a cycle")]
    LoopLimitExceeded(usize),

    #[error("Run cancelled")]
    Cancelled,

    // Tool errors
    #[error("Tool not registered: {0}")]
    ToolNotRegistered(String),

    #[error("Step failed at node {node} ({tool}): {message}")]
    Execution {
        node: String,
        tool: String,
        message: String,
    },

    #[error("Step timeout after {timeout_secs}s at node {node} ({tool})")]
    StepTimeout {
        node: String,
        tool: String,
        timeout_secs: u64,
    },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChainflowError {
    /// Shorthand for a step fault raised by a tool.
    pub fn step(
        node: impl Into<String>,
        tool: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Execution {
            node: node.into(),
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Classification persisted with a failed run.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::ToolNotRegistered(_) => FailureKind::ToolNotRegistered,
            Self::LoopLimitExceeded(_) => FailureKind::LoopLimitExceeded,
            Self::Execution { .. } => FailureKind::Execution,
            Self::StepTimeout { .. } => FailureKind::Timeout,
            Self::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChainflowError>;
