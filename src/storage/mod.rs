//! Persistence module
//!
//! SQLite-backed history log and persisted configuration

pub mod history;

pub use history::{HistoryStore, RecordStatus};
