//! Graph execution: walks a definition's successor chain from the entry node,
//! dispatching each node's tool through the registry and threading the
//! workflow state from step to step.
//!
//! A run stops when a step returns `done = true`, when the current node has
//! no outgoing edge, or with an error (unregistered tool, step fault, step
//! timeout, cancellation, or the step ceiling).

pub mod executor;

pub use executor::{ExecutionFailure, ExecutionResult, GraphExecutor, RunOptions};
