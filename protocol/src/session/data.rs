//! Per-role session state: what one side of a transfer knows and has done.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{Role, SessionParams};
use crate::asset::Asset;
use crate::config;
use crate::crypto::GatewayPublicKey;
use crate::messages::{MessageType, STAGE_FINAL_MESSAGES};
use crate::satp::SatpError;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Lifecycle of a session.
///
/// ```text
/// Initializing → TransferProposed → Locked → CommitPreparing → Completed
///        \______________\______________\__________\
///                                                  → Recovering → RolledBack
///                                                              ↘ Completed
/// Failed: retry budget exhausted (the crash manager may still repair it)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Initializing,
    TransferProposed,
    Locked,
    CommitPreparing,
    Completed,
    Recovering,
    Failed,
    RolledBack,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::RolledBack
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Initializing => "INITIALIZING",
            SessionState::TransferProposed => "TRANSFER_PROPOSED",
            SessionState::Locked => "LOCKED",
            SessionState::CommitPreparing => "COMMIT_PREPARING",
            SessionState::Completed => "COMPLETED",
            SessionState::Recovering => "RECOVERING",
            SessionState::Failed => "FAILED",
            SessionState::RolledBack => "ROLLED_BACK",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// SessionData
// ---------------------------------------------------------------------------

/// One side's view of a transfer. A gateway acting as client holds the
/// client data; the counterparty holds the matching server data. Both are
/// snapshotted into every log entry, which is what recovery rebuilds from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub id: String,
    pub context_id: String,
    pub version: String,
    pub state: SessionState,
    pub role: Role,
    pub last_sequence_number: u64,
    pub max_retries: u32,
    pub max_timeout_ms: u64,
    pub client_gateway_pubkey: GatewayPublicKey,
    pub server_gateway_pubkey: GatewayPublicKey,
    pub sender_gateway_network_id: String,
    pub recipient_gateway_network_id: String,
    pub sender_asset: Option<Asset>,
    pub receiver_asset: Option<Asset>,
    /// One digest per message type, append-only.
    pub hashes: BTreeMap<MessageType, String>,
    pub originator: String,
    pub beneficiary: String,
    /// Retries spent so far across the whole transfer.
    pub retry_count: u32,
    /// Ledger transaction ids keyed by operation name (`lock`, `mint`, ...).
    #[serde(default)]
    pub receipts: BTreeMap<String, String>,
    pub created_at_ms: u64,
}

impl SessionData {
    pub fn new(id: String, context_id: String, role: Role, params: &SessionParams) -> Self {
        Self {
            id,
            context_id,
            version: config::SATP_VERSION.to_string(),
            state: SessionState::Initializing,
            role,
            last_sequence_number: 0,
            max_retries: params.max_retries,
            max_timeout_ms: params.max_timeout_ms,
            client_gateway_pubkey: params.client_gateway_pubkey.clone(),
            server_gateway_pubkey: params.server_gateway_pubkey.clone(),
            sender_gateway_network_id: params.sender_gateway_network_id.clone(),
            recipient_gateway_network_id: params.recipient_gateway_network_id.clone(),
            sender_asset: params.sender_asset.clone(),
            receiver_asset: params.receiver_asset.clone(),
            hashes: BTreeMap::new(),
            originator: params.originator.clone(),
            beneficiary: params.beneficiary.clone(),
            retry_count: 0,
            receipts: BTreeMap::new(),
            created_at_ms: crate::now_ms(),
        }
    }

    // -- Hashes --------------------------------------------------------------

    /// Record the digest of `message_type`.
    ///
    /// Fails with [`SatpError::HashAlreadySet`] if a digest is already
    /// present, and with [`SatpError::HashOutOfOrder`] if any stage before
    /// the message's own stage is incomplete.
    pub fn set_hash(&mut self, message_type: MessageType, hash: String) -> Result<(), SatpError> {
        if self.hashes.contains_key(&message_type) {
            return Err(SatpError::HashAlreadySet {
                session_id: self.id.clone(),
                message_type,
            });
        }
        if let Some(stage) = message_type.stage() {
            if let Some(missing) = (0..stage).find(|s| !self.is_stage_complete(*s)) {
                return Err(SatpError::HashOutOfOrder {
                    message_type,
                    missing_stage: missing,
                });
            }
        }
        self.hashes.insert(message_type, hash);
        Ok(())
    }

    pub fn hash_of(&self, message_type: MessageType) -> Option<&str> {
        self.hashes.get(&message_type).map(String::as_str)
    }

    /// Digest of the final message of `stage`, if the stage is complete.
    pub fn stage_hash(&self, stage: u8) -> Option<&str> {
        STAGE_FINAL_MESSAGES
            .get(stage as usize)
            .and_then(|t| self.hash_of(*t))
    }

    pub fn is_stage_complete(&self, stage: u8) -> bool {
        self.stage_hash(stage).is_some()
    }

    /// Number of leading stages that are complete.
    pub fn completed_stages(&self) -> u8 {
        (0..STAGE_FINAL_MESSAGES.len() as u8)
            .take_while(|s| self.is_stage_complete(*s))
            .count() as u8
    }

    /// Value for `hash_previous_message` of an outgoing `message_type`.
    pub fn previous_hash_for(&self, message_type: MessageType) -> String {
        message_type
            .previous()
            .and_then(|prev| self.hash_of(prev))
            .unwrap_or_default()
            .to_string()
    }

    // -- Sequence numbers ----------------------------------------------------

    /// Advance and return the sequence number for a new outbound message.
    pub fn next_sequence_number(&mut self) -> u64 {
        self.last_sequence_number += 1;
        self.last_sequence_number
    }

    /// Accept an inbound sequence number. Anything not strictly greater than
    /// the last accepted one is stale.
    pub fn accept_sequence_number(&mut self, sequence_number: u64) -> Result<(), SatpError> {
        if sequence_number <= self.last_sequence_number {
            return Err(SatpError::StaleMessage {
                session_id: self.id.clone(),
                received: sequence_number,
                last: self.last_sequence_number,
            });
        }
        self.last_sequence_number = sequence_number;
        Ok(())
    }

    pub fn amount(&self) -> u64 {
        self.sender_asset.as_ref().map(|a| a.amount).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::GatewayKeypair;

    fn data() -> SessionData {
        let params = SessionParams::new(
            GatewayKeypair::from_seed(&[1; 32]).public_key(),
            GatewayKeypair::from_seed(&[2; 32]).public_key(),
            "besu",
            "fabric",
        );
        SessionData::new("s".into(), "c".into(), Role::Client, &params)
    }

    fn complete_stage(d: &mut SessionData, stage: u8) {
        let final_msg = STAGE_FINAL_MESSAGES[stage as usize];
        d.set_hash(final_msg, format!("h{}", stage)).unwrap();
    }

    #[test]
    fn sequence_numbers_strictly_increase() {
        let mut d = data();
        let a = d.next_sequence_number();
        let b = d.next_sequence_number();
        assert!(b > a);

        let mut server = data();
        server.accept_sequence_number(3).unwrap();
        assert!(matches!(
            server.accept_sequence_number(3),
            Err(SatpError::StaleMessage { received: 3, last: 3, .. })
        ));
        assert!(server.accept_sequence_number(2).is_err());
        server.accept_sequence_number(4).unwrap();
    }

    #[test]
    fn hash_is_append_only() {
        let mut d = data();
        d.set_hash(MessageType::NewSessionRequest, "a".into()).unwrap();
        let err = d
            .set_hash(MessageType::NewSessionRequest, "b".into())
            .unwrap_err();
        assert!(matches!(err, SatpError::HashAlreadySet { .. }));
        assert_eq!(d.hash_of(MessageType::NewSessionRequest), Some("a"));
    }

    #[test]
    fn hash_for_later_stage_requires_earlier_stages() {
        let mut d = data();
        let err = d
            .set_hash(MessageType::LockAssertionRequest, "x".into())
            .unwrap_err();
        assert!(matches!(
            err,
            SatpError::HashOutOfOrder { missing_stage: 0, .. }
        ));

        complete_stage(&mut d, 0);
        complete_stage(&mut d, 1);
        d.set_hash(MessageType::LockAssertionRequest, "x".into()).unwrap();
        assert_eq!(d.completed_stages(), 2);
        assert_eq!(d.stage_hash(1), Some("h1"));
        assert_eq!(d.stage_hash(2), None);
    }

    #[test]
    fn previous_hash_follows_message_order() {
        let mut d = data();
        assert_eq!(d.previous_hash_for(MessageType::NewSessionRequest), "");
        d.set_hash(MessageType::NewSessionResponse, "r0".into()).unwrap();
        assert_eq!(d.previous_hash_for(MessageType::PreTransferRequest), "r0");
    }

    #[test]
    fn recovery_messages_skip_stage_ordering() {
        let mut d = data();
        d.set_hash(MessageType::RollbackAck, "z".into()).unwrap();
    }
}
