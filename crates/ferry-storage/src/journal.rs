//! Task journal
//!
//! One row per task a session has issued and not yet finished. Rows are
//! removed as soon as the task delivers its completion, so whatever is left
//! under an identifier after a crash is exactly the work to reattach.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::database::Database;
use crate::error::StorageError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskRecordState {
    /// Created but never resumed
    Suspended,
    /// Transfer in progress
    Running,
}

impl TaskRecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRecordState::Suspended => "suspended",
            TaskRecordState::Running => "running",
        }
    }
}

impl std::str::FromStr for TaskRecordState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "suspended" => Ok(TaskRecordState::Suspended),
            "running" => Ok(TaskRecordState::Running),
            _ => Err(format!("Unknown task state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub session_identifier: String,
    pub task_id: u64,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub state: TaskRecordState,
    pub bytes_received: u64,
    pub partial_path: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        session_identifier: &str,
        task_id: u64,
        url: String,
        headers: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();

        Self {
            session_identifier: session_identifier.to_string(),
            task_id,
            url,
            headers,
            state: TaskRecordState::Suspended,
            bytes_received: 0,
            partial_path: None,
            etag: None,
            last_modified: None,
            created_at: now,
            updated_at: now,
        }
    }
}

pub struct TaskJournal {
    db: Database,
}

impl TaskJournal {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Record a session identifier. Registering an identifier twice keeps
    /// the original row so reattaching does not reset it.
    pub fn register_session(&self, identifier: &str) -> Result<()> {
        let created_at = Utc::now().to_rfc3339();
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO transfer_sessions (identifier, created_at) VALUES (?1, ?2)",
                rusqlite::params![identifier, created_at],
            )?;
            Ok(())
        })?;

        tracing::debug!(session_id = %identifier, "Registered transfer session");
        Ok(())
    }

    /// Mark a session as torn down and forget its tasks.
    pub fn invalidate_session(&self, identifier: &str) -> Result<()> {
        let invalidated_at = Utc::now().to_rfc3339();
        self.db.transaction(|conn| {
            conn.execute(
                "UPDATE transfer_sessions SET invalidated_at = ?2 WHERE identifier = ?1",
                rusqlite::params![identifier, invalidated_at],
            )?;
            conn.execute(
                "DELETE FROM transfer_tasks WHERE session_identifier = ?1",
                [identifier],
            )?;
            Ok(())
        })?;

        tracing::debug!(session_id = %identifier, "Invalidated transfer session");
        Ok(())
    }

    pub fn is_invalidated(&self, identifier: &str) -> Result<bool> {
        let invalidated: Option<Option<String>> = self.db.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT invalidated_at FROM transfer_sessions WHERE identifier = ?1",
                    [identifier],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        Ok(matches!(invalidated, Some(Some(_))))
    }

    pub fn save_task(&self, record: &TaskRecord) -> Result<()> {
        let headers = serde_json::to_string(&record.headers)?;

        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO transfer_tasks
                 (session_identifier, task_id, url, headers, state, bytes_received,
                  partial_path, etag, last_modified, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    record.session_identifier,
                    record.task_id as i64,
                    record.url,
                    headers,
                    record.state.as_str(),
                    record.bytes_received as i64,
                    record.partial_path,
                    record.etag,
                    record.last_modified,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn set_state(&self, identifier: &str, task_id: u64, state: TaskRecordState) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE transfer_tasks SET state = ?3, updated_at = ?4
                 WHERE session_identifier = ?1 AND task_id = ?2",
                rusqlite::params![identifier, task_id as i64, state.as_str(), updated_at],
            )?;
            Ok(())
        })
    }

    /// Remember where a running task's partial file lives and which
    /// validators the server sent, so a restart can continue it.
    pub fn set_partial(
        &self,
        identifier: &str,
        task_id: u64,
        partial_path: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE transfer_tasks
                 SET partial_path = ?3, etag = ?4, last_modified = ?5, updated_at = ?6
                 WHERE session_identifier = ?1 AND task_id = ?2",
                rusqlite::params![
                    identifier,
                    task_id as i64,
                    partial_path,
                    etag,
                    last_modified,
                    updated_at
                ],
            )?;
            Ok(())
        })
    }

    /// Record how much of the partial file is usable after a transfer
    /// stopped early.
    pub fn set_bytes_received(&self, identifier: &str, task_id: u64, bytes: u64) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE transfer_tasks SET bytes_received = ?3, updated_at = ?4
                 WHERE session_identifier = ?1 AND task_id = ?2",
                rusqlite::params![identifier, task_id as i64, bytes as i64, updated_at],
            )?;
            Ok(())
        })
    }

    pub fn remove_task(&self, identifier: &str, task_id: u64) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "DELETE FROM transfer_tasks WHERE session_identifier = ?1 AND task_id = ?2",
                rusqlite::params![identifier, task_id as i64],
            )?;
            Ok(())
        })
    }

    /// Tasks that were transferring when the journal was last written.
    pub fn running_tasks(&self, identifier: &str) -> Result<Vec<TaskRecord>> {
        self.tasks_in_state(identifier, TaskRecordState::Running)
    }

    pub fn highest_task_id(&self, identifier: &str) -> Result<Option<u64>> {
        let max: Option<i64> = self.db.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT MAX(task_id) FROM transfer_tasks WHERE session_identifier = ?1",
                [identifier],
                |row| row.get(0),
            )?)
        })?;

        Ok(max.map(|v| v as u64))
    }

    fn tasks_in_state(&self, identifier: &str, state: TaskRecordState) -> Result<Vec<TaskRecord>> {
        let rows = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, url, headers, state, bytes_received, partial_path,
                        etag, last_modified, created_at, updated_at
                 FROM transfer_tasks
                 WHERE session_identifier = ?1 AND state = ?2
                 ORDER BY task_id",
            )?;

            let rows: Vec<RawRow> = stmt
                .query_map(rusqlite::params![identifier, state.as_str()], |row| {
                    Ok(RawRow {
                        task_id: row.get::<_, i64>(0)? as u64,
                        url: row.get(1)?,
                        headers: row.get(2)?,
                        state: row.get(3)?,
                        bytes_received: row.get::<_, i64>(4)? as u64,
                        partial_path: row.get(5)?,
                        etag: row.get(6)?,
                        last_modified: row.get(7)?,
                        created_at: row.get(8)?,
                        updated_at: row.get(9)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();

            Ok(rows)
        })?;

        rows.into_iter()
            .map(|raw| raw.into_record(identifier))
            .collect()
    }
}

impl Clone for TaskJournal {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

struct RawRow {
    task_id: u64,
    url: String,
    headers: String,
    state: String,
    bytes_received: u64,
    partial_path: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn into_record(self, identifier: &str) -> Result<TaskRecord> {
        let headers: BTreeMap<String, String> = serde_json::from_str(&self.headers)?;
        let state = self
            .state
            .parse()
            .map_err(StorageError::InvalidRecord)?;

        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(TaskRecord {
            session_identifier: identifier.to_string(),
            task_id: self.task_id,
            url: self.url,
            headers,
            state,
            bytes_received: self.bytes_received,
            partial_path: self.partial_path,
            etag: self.etag,
            last_modified: self.last_modified,
            created_at,
            updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal_with_session(identifier: &str) -> TaskJournal {
        let journal = TaskJournal::open_in_memory().unwrap();
        journal.register_session(identifier).unwrap();
        journal
    }

    #[test]
    fn test_running_tasks_survive_reopen_of_identifier() {
        let journal = journal_with_session("ferry_a");

        let mut headers = BTreeMap::new();
        headers.insert("X-Token".to_string(), "abc".to_string());

        let url = "https://example.com/a.bin".to_string();
        let record = TaskRecord::new("ferry_a", 1, url, headers);
        journal.save_task(&record).unwrap();
        journal
            .save_task(&TaskRecord::new(
                "ferry_a",
                2,
                "https://example.com/b.bin".to_string(),
                BTreeMap::new(),
            ))
            .unwrap();

        journal.set_state("ferry_a", 1, TaskRecordState::Running).unwrap();
        journal
            .set_partial("ferry_a", 1, "/tmp/1.download", Some("\"v1\""), None)
            .unwrap();

        let running = journal.running_tasks("ferry_a").unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id, 1);
        assert_eq!(running[0].headers.get("X-Token").map(String::as_str), Some("abc"));
        assert_eq!(running[0].partial_path.as_deref(), Some("/tmp/1.download"));
        assert_eq!(running[0].etag.as_deref(), Some("\"v1\""));
        assert_eq!(running[0].bytes_received, 0);

        journal.set_bytes_received("ferry_a", 1, 4096).unwrap();
        assert_eq!(journal.running_tasks("ferry_a").unwrap()[0].bytes_received, 4096);

        assert_eq!(journal.highest_task_id("ferry_a").unwrap(), Some(2));
        assert_eq!(journal.highest_task_id("ferry_b").unwrap(), None);
    }

    #[test]
    fn test_remove_task() {
        let journal = journal_with_session("ferry_a");
        let url = "https://example.com/x".to_string();
        let record = TaskRecord::new("ferry_a", 7, url, BTreeMap::new());
        journal.save_task(&record).unwrap();
        journal.set_state("ferry_a", 7, TaskRecordState::Running).unwrap();

        journal.remove_task("ferry_a", 7).unwrap();
        assert!(journal.running_tasks("ferry_a").unwrap().is_empty());
    }

    #[test]
    fn test_invalidate_session_drops_tasks() {
        let journal = journal_with_session("ferry_a");
        let mut record =
            TaskRecord::new("ferry_a", 1, "https://example.com/x".to_string(), BTreeMap::new());
        record.state = TaskRecordState::Running;
        journal.save_task(&record).unwrap();

        assert!(!journal.is_invalidated("ferry_a").unwrap());
        journal.invalidate_session("ferry_a").unwrap();

        assert!(journal.is_invalidated("ferry_a").unwrap());
        assert!(journal.running_tasks("ferry_a").unwrap().is_empty());
        assert!(!journal.is_invalidated("unknown").unwrap());
    }

    #[test]
    fn test_state_parse() {
        assert_eq!("Running".parse::<TaskRecordState>(), Ok(TaskRecordState::Running));
        assert!("done".parse::<TaskRecordState>().is_err());
    }
}
