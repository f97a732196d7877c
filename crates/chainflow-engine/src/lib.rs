pub mod graph;
pub mod run_log;
pub mod runner;

pub use graph::{ExecutionFailure, ExecutionResult, GraphExecutor, RunOptions};
pub use run_log::RunLogger;
pub use runner::RunManager;
