pub mod builtin;
pub mod registry;

pub use builtin::code_review::default_review_graph;
pub use registry::{FnTool, ToolRegistry};
