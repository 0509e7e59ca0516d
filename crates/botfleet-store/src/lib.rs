//! Botfleet Store: durable SQLite storage for the research orchestrator.

pub mod schema;
pub mod sqlite;
pub mod types;

pub use sqlite::SqliteStore;
pub use types::*;
