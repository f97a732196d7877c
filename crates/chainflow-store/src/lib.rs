pub mod memory;
pub mod sqlite;

pub use memory::{InMemoryGraphStore, InMemoryRunStore};
pub use sqlite::SqliteStore;
