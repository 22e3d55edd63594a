//! The log storage contract.

use super::entry::{LocalLog, RemoteLog};

/// Errors that can occur during log operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt log entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type LogResult<T> = Result<T, LogError>;

/// Append-only, key-addressed store of local and remote protocol logs.
///
/// Implementations must be safe for concurrent writers. An append for a key
/// that already exists leaves the stored entry untouched and reports
/// `Ok(false)`.
pub trait LogRepository: Send + Sync {
    /// Append a local entry. `Ok(true)` if it was written, `Ok(false)` if an
    /// entry with the same key was already present.
    fn append(&self, log: &LocalLog) -> LogResult<bool>;

    fn read_by_key(&self, key: &str) -> LogResult<Option<LocalLog>>;

    /// All entries of a session in the order they were appended.
    fn read_by_session(&self, session_id: &str) -> LogResult<Vec<LocalLog>>;

    /// Newest entry of a session.
    fn last_entry(&self, session_id: &str) -> LogResult<Option<LocalLog>> {
        Ok(self.read_by_session(session_id)?.pop())
    }

    /// Timestamp of the newest entry of a session.
    fn last_timestamp(&self, session_id: &str) -> LogResult<Option<u64>>;

    /// Every session id with at least one entry.
    fn session_ids(&self) -> LogResult<Vec<String>>;

    /// Store a counterparty's signed digest. Same no-overwrite rule as
    /// [`append`](Self::append).
    fn append_remote(&self, log: &RemoteLog) -> LogResult<bool>;

    fn read_remote(&self, key: &str) -> LogResult<Option<RemoteLog>>;

    /// Remote proofs stored for a session.
    fn read_remote_by_session(&self, session_id: &str) -> LogResult<Vec<RemoteLog>>;

    /// Block until everything appended so far is durable.
    fn flush(&self) -> LogResult<()>;
}
