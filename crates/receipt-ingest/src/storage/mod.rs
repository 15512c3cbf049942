//! SQLite persistence for receipt records, sessions and the shared API quota

pub mod database;

pub use database::{ReceiptDb, ReceiptDbStats, ReceiptRecord};
