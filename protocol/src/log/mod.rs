//! # Protocol Logs
//!
//! The write-ahead log every SATP step goes through. A gateway writes a
//! [`LocalLog`] with operation `init` before it sends a message or touches a
//! ledger and `done` after the step succeeds. Entries are keyed
//! `"{session_id}-{log_type}-{operation}"` and never overwritten, so a
//! replayed step is harmless.
//!
//! [`RemoteLog`]s are signed digests of local entries. They are what the
//! crash manager exchanges with the counterparty during recovery.

pub mod entry;
pub mod repository;
pub mod sled_store;

pub use entry::{
    ledger_log_type, log_key, rollback_log_type, LocalLog, LogOperation, RemoteLog,
    LOG_TYPE_RECOVERY, LOG_TYPE_ROLLBACK, LOG_TYPE_TRANSFER, LOG_TYPE_TRANSFER_COMPLETE,
};
pub use repository::{LogError, LogRepository, LogResult};
pub use sled_store::SledLogStore;
