//! Ferry Storage Layer
//!
//! SQLite-backed journal of the tasks each background session has in flight.
//! A session identifier is the only key: reopening the journal with the same
//! identifier after a restart yields the tasks that were still running.

mod database;
mod error;
mod journal;
mod migrations;

pub use database::Database;
pub use error::StorageError;
pub use journal::{TaskJournal, TaskRecord, TaskRecordState};

pub type Result<T> = std::result::Result<T, StorageError>;
