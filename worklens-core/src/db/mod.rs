//! Database storage layer
//!
//! SQLite-backed persistence for raw signals, derived records, and
//! discovered directories.

mod repo;
pub mod schema;

pub use repo::Database;
