//! # SledLogStore
//!
//! The persistent [`LogRepository`], built on sled.
//!
//! ## Tree Layout
//!
//! | Tree            | Key                                | Value                 |
//! |-----------------|------------------------------------|-----------------------|
//! | `logs`          | log key (UTF-8)                    | `bincode(LocalLog)`   |
//! | `remote_logs`   | log key (UTF-8)                    | `bincode(RemoteLog)`  |
//! | `sessions`      | session id (UTF-8)                 | last timestamp (8B BE)|
//! | `session_index` | session id, `0x00`, write id (8B BE) | log key (UTF-8)     |
//!
//! `session_index` keeps each session's entries in append order; sled's
//! lexicographic ordering over the big-endian write id does the sorting.
//! An append touches `logs`, `session_index` and `sessions` in one sled
//! transaction, so an entry is either fully indexed or absent.

use sled::transaction::{ConflictableTransactionResult, TransactionError, Transactional};
use sled::{Db, Tree};
use std::path::Path;

use super::entry::{LocalLog, RemoteLog};
use super::repository::{LogError, LogRepository, LogResult};

#[derive(Debug, Clone)]
pub struct SledLogStore {
    db: Db,
    logs: Tree,
    remote_logs: Tree,
    sessions: Tree,
    session_index: Tree,
}

impl SledLogStore {
    /// Open or create a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> LogResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory store removed on drop. For tests.
    pub fn open_temporary() -> LogResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> LogResult<Self> {
        Ok(Self {
            logs: db.open_tree("logs")?,
            remote_logs: db.open_tree("remote_logs")?,
            sessions: db.open_tree("sessions")?,
            session_index: db.open_tree("session_index")?,
            db,
        })
    }

    fn index_prefix(session_id: &str) -> Vec<u8> {
        let mut prefix = session_id.as_bytes().to_vec();
        prefix.push(0);
        prefix
    }

    fn decode_local(key: &[u8], bytes: &[u8]) -> LogResult<LocalLog> {
        bincode::deserialize(bytes).map_err(|e| LogError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: e.to_string(),
        })
    }

    fn decode_remote(key: &[u8], bytes: &[u8]) -> LogResult<RemoteLog> {
        bincode::deserialize(bytes).map_err(|e| LogError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: e.to_string(),
        })
    }
}

impl LogRepository for SledLogStore {
    fn append(&self, log: &LocalLog) -> LogResult<bool> {
        let value = bincode::serialize(log).map_err(|e| LogError::Serialization(e.to_string()))?;
        let mut index_key = Self::index_prefix(&log.session_id);
        index_key.extend_from_slice(&self.db.generate_id()?.to_be_bytes());
        let timestamp = log.timestamp_ms.to_be_bytes();

        let result = (&self.logs, &self.session_index, &self.sessions).transaction(
            |(logs, index, sessions)| -> ConflictableTransactionResult<bool, ()> {
                if logs.get(log.key.as_bytes())?.is_some() {
                    return Ok(false);
                }
                logs.insert(log.key.as_bytes(), value.as_slice())?;
                index.insert(index_key.as_slice(), log.key.as_bytes())?;
                sessions.insert(log.session_id.as_bytes(), &timestamp[..])?;
                Ok(true)
            },
        );

        match result {
            Ok(inserted) => Ok(inserted),
            Err(TransactionError::Storage(e)) => Err(LogError::Sled(e)),
            Err(TransactionError::Abort(())) => Ok(false),
        }
    }

    fn read_by_key(&self, key: &str) -> LogResult<Option<LocalLog>> {
        match self.logs.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_local(key.as_bytes(), &bytes)?)),
            None => Ok(None),
        }
    }

    fn read_by_session(&self, session_id: &str) -> LogResult<Vec<LocalLog>> {
        let mut entries = Vec::new();
        for item in self.session_index.scan_prefix(Self::index_prefix(session_id)) {
            let (_, log_key) = item?;
            if let Some(bytes) = self.logs.get(&log_key)? {
                entries.push(Self::decode_local(&log_key, &bytes)?);
            }
        }
        Ok(entries)
    }

    fn last_timestamp(&self, session_id: &str) -> LogResult<Option<u64>> {
        match self.sessions.get(session_id.as_bytes())? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| LogError::Corrupt {
                    key: session_id.to_string(),
                    reason: "invalid timestamp bytes".to_string(),
                })?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn session_ids(&self) -> LogResult<Vec<String>> {
        let mut ids = Vec::new();
        for key in self.sessions.iter().keys() {
            ids.push(String::from_utf8_lossy(&key?).into_owned());
        }
        Ok(ids)
    }

    fn append_remote(&self, log: &RemoteLog) -> LogResult<bool> {
        let value = bincode::serialize(log).map_err(|e| LogError::Serialization(e.to_string()))?;
        let swapped = self.remote_logs.compare_and_swap(
            log.key.as_bytes(),
            None as Option<&[u8]>,
            Some(value),
        )?;
        Ok(swapped.is_ok())
    }

    fn read_remote(&self, key: &str) -> LogResult<Option<RemoteLog>> {
        match self.remote_logs.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_remote(key.as_bytes(), &bytes)?)),
            None => Ok(None),
        }
    }

    fn read_remote_by_session(&self, session_id: &str) -> LogResult<Vec<RemoteLog>> {
        let prefix = format!("{}-", session_id);
        let mut proofs = Vec::new();
        for item in self.remote_logs.scan_prefix(prefix.as_bytes()) {
            let (key, bytes) = item?;
            proofs.push(Self::decode_remote(&key, &bytes)?);
        }
        Ok(proofs)
    }

    fn flush(&self) -> LogResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
