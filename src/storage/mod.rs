//! Storage layer: accounts, the credit ledger, and generated reports.

mod models;
mod sqlite;

pub use models::*;
pub use sqlite::SqliteStorage;
