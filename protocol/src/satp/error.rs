//! Error types for the SATP engine.
//!
//! Every protocol operation that can fail returns a [`SatpError`].
//! [`SatpError::RetryExhausted`] is the single error a transfer ends with
//! once its retry budget is spent; it carries the failure of the last
//! attempt.

use thiserror::Error;

use crate::crosschain::LedgerError;
use crate::log::LogError;
use crate::messages::MessageType;
use crate::orchestrator::TransportError;
use crate::session::{Role, SessionState};

#[derive(Debug, Error)]
pub enum SatpError {
    /// Pre-flight rejection of a request. Nothing was logged or executed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A single, non-retried failure of a transfer operation.
    #[error("transact error: {0}")]
    Transact(String),

    #[error("session {session_id}: retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        session_id: String,
        attempts: u32,
        last_error: Box<SatpError>,
    },

    #[error("signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("session {session_id} has no {role} data")]
    SessionDataNotAvailable { session_id: String, role: Role },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session reached a terminal state and takes no further messages.
    #[error("session {session_id} is closed ({state})")]
    SessionClosed {
        session_id: String,
        state: SessionState,
    },

    #[error("session {session_id}: hash for {message_type} already set")]
    HashAlreadySet {
        session_id: String,
        message_type: MessageType,
    },

    #[error("hash for {message_type} set before stage {missing_stage} completed")]
    HashOutOfOrder {
        message_type: MessageType,
        missing_stage: u8,
    },

    #[error("session {session_id}: stale message with sequence {received} (last accepted {last})")]
    StaleMessage {
        session_id: String,
        received: u64,
        last: u64,
    },

    #[error("rejected by counterparty: {0}")]
    Rejected(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("unknown gateway: {0}")]
    UnknownGateway(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SatpError {
    /// Whether another attempt at the same step could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SatpError::SignatureVerification(_)
                | SatpError::StaleMessage { .. }
                | SatpError::Rejected(_)
                | SatpError::Timeout(_)
                | SatpError::Transport(_)
                | SatpError::Log(_)
                | SatpError::Ledger(_)
                | SatpError::SessionNotFound(_)
        )
    }

    /// Short machine-readable name, used in error replies and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            SatpError::Validation(_) => "validation",
            SatpError::Transact(_) => "transact",
            SatpError::RetryExhausted { .. } => "retry_exhausted",
            SatpError::SignatureVerification(_) => "signature_verification",
            SatpError::SessionDataNotAvailable { .. } => "session_data_not_available",
            SatpError::SessionNotFound(_) => "session_not_found",
            SatpError::SessionClosed { .. } => "session_closed",
            SatpError::HashAlreadySet { .. } => "hash_already_set",
            SatpError::HashOutOfOrder { .. } => "hash_out_of_order",
            SatpError::StaleMessage { .. } => "stale_message",
            SatpError::Rejected(_) => "rejected",
            SatpError::Timeout(_) => "timeout",
            SatpError::UnknownGateway(_) => "unknown_gateway",
            SatpError::Transport(_) => "transport",
            SatpError::Log(_) => "log",
            SatpError::Ledger(_) => "ledger",
            SatpError::Serialization(_) => "serialization",
        }
    }
}
