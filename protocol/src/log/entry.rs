//! Log entry types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{hash_object, GatewayKeypair, GatewayPublicKey, GatewaySignature};

// ---------------------------------------------------------------------------
// Well-known log types
// ---------------------------------------------------------------------------

/// Session-level entries (`init` on creation, `fail` on retry exhaustion).
pub const LOG_TYPE_TRANSFER: &str = "transfer";
/// Terminal entry of a successful transfer (`done`).
pub const LOG_TYPE_TRANSFER_COMPLETE: &str = "transfer-complete";
/// Terminal entry of a rolled-back transfer (`done`); `init` marks the start
/// of a rollback.
pub const LOG_TYPE_ROLLBACK: &str = "rollback";
/// Written when the crash manager takes over a session.
pub const LOG_TYPE_RECOVERY: &str = "recovery";

/// `ledger-{op}` for a forward ledger effect.
pub fn ledger_log_type(operation: impl fmt::Display) -> String {
    format!("ledger-{}", operation)
}

/// `rollback-{op}` for a compensating ledger effect.
pub fn rollback_log_type(operation: impl fmt::Display) -> String {
    format!("rollback-{}", operation)
}

/// `"{session_id}-{log_type}-{operation}"`.
pub fn log_key(session_id: &str, log_type: &str, operation: LogOperation) -> String {
    format!("{}-{}-{}", session_id, log_type, operation)
}

// ---------------------------------------------------------------------------
// LogOperation
// ---------------------------------------------------------------------------

/// `init` is written before an outbound message or ledger effect, `done`
/// after it completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOperation {
    Init,
    Exec,
    Done,
    Fail,
    Ack,
}

impl fmt::Display for LogOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogOperation::Init => "init",
            LogOperation::Exec => "exec",
            LogOperation::Done => "done",
            LogOperation::Fail => "fail",
            LogOperation::Ack => "ack",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// LocalLog
// ---------------------------------------------------------------------------

/// One write-ahead entry in this gateway's own log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalLog {
    pub session_id: String,
    pub log_type: String,
    pub key: String,
    pub operation: LogOperation,
    pub timestamp_ms: u64,
    /// JSON payload. For protocol entries this is a session record.
    pub data: String,
    pub sequence_number: u64,
}

impl LocalLog {
    pub fn new(
        session_id: impl Into<String>,
        log_type: impl Into<String>,
        operation: LogOperation,
        data: String,
        sequence_number: u64,
    ) -> Self {
        let session_id = session_id.into();
        let log_type = log_type.into();
        Self {
            key: log_key(&session_id, &log_type, operation),
            session_id,
            log_type,
            operation,
            timestamp_ms: crate::now_ms(),
            data,
            sequence_number,
        }
    }

    /// Whether this entry closes the session for good.
    pub fn is_terminal(&self) -> bool {
        self.operation == LogOperation::Done
            && (self.log_type == LOG_TYPE_TRANSFER_COMPLETE || self.log_type == LOG_TYPE_ROLLBACK)
    }

    pub fn is(&self, log_type: &str, operation: LogOperation) -> bool {
        self.log_type == log_type && self.operation == operation
    }

    /// Hex SHA-256 over the canonical JSON of the entry.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        hash_object(self)
    }
}

// ---------------------------------------------------------------------------
// RemoteLog
// ---------------------------------------------------------------------------

/// Signed digest of a [`LocalLog`]. Gateways exchange these during recovery
/// so each side holds non-repudiable evidence of what the other did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLog {
    pub key: String,
    pub hash: String,
    /// Signature over the hex digest's bytes.
    pub signature: GatewaySignature,
    pub signer_pubkey: GatewayPublicKey,
}

impl RemoteLog {
    pub fn sign(log: &LocalLog, keypair: &GatewayKeypair) -> Result<Self, serde_json::Error> {
        let hash = log.digest()?;
        Ok(Self {
            key: log.key.clone(),
            signature: keypair.sign(hash.as_bytes()),
            hash,
            signer_pubkey: keypair.public_key(),
        })
    }

    /// Check this proof against the entry it claims to cover and the key the
    /// signer is expected to hold.
    pub fn verify(&self, log: &LocalLog, expected_signer: &GatewayPublicKey) -> bool {
        if &self.signer_pubkey != expected_signer || self.key != log.key {
            return false;
        }
        match log.digest() {
            Ok(hash) if hash == self.hash => {
                expected_signer.verify(self.hash.as_bytes(), &self.signature)
            }
            _ => false,
        }
    }
}
