//! # SATP Wire Messages
//!
//! Every gateway-to-gateway exchange is a signed [`SatpMessage`] envelope.
//! The envelope carries the session coordinates (session id, sequence
//! number, both gateways' keys), the hash of the message that preceded it
//! in the protocol, and a typed [`Payload`].
//!
//! ## Message Order
//!
//! ```text
//! Stage 0  NewSessionRequest        → NewSessionResponse
//!          PreTransferRequest       → PreTransferResponse
//! Stage 1  TransferProposalRequest  → TransferProposalReceipt | TransferProposalReject
//!          TransferCommenceRequest  → TransferCommenceResponse
//! Stage 2  LockAssertionRequest     → LockAssertionReceipt
//! Stage 3  CommitPreparationRequest → CommitReadyResponse
//!          CommitFinalAssertionRequest → CommitFinalAcknowledgementReceipt
//!          TransferCompleteRequest  → TransferCompleteResponse
//! ```
//!
//! Recovery messages (`Recover*`, `Rollback*`) and `Error` replies sit
//! outside the hash chain.
//!
//! ## Signing
//!
//! The signature covers the canonical JSON of the envelope with the
//! `signature` field cleared. The message *hash* recorded in session data
//! covers the full signed envelope, so both gateways derive the same digest
//! for the same bytes on the wire.

pub mod payloads;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config;
use crate::crypto::{hash_object, GatewayPublicKey, GatewaySignature, Signable};
use crate::satp::SatpError;
use crate::session::SessionData;

pub use payloads::*;

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// Message kinds in protocol order. The derived `Ord` follows declaration
/// order, which is the order messages are exchanged in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    NewSessionRequest,
    NewSessionResponse,
    PreTransferRequest,
    PreTransferResponse,
    TransferProposalRequest,
    TransferProposalReceipt,
    TransferProposalReject,
    TransferCommenceRequest,
    TransferCommenceResponse,
    LockAssertionRequest,
    LockAssertionReceipt,
    CommitPreparationRequest,
    CommitReadyResponse,
    CommitFinalAssertionRequest,
    CommitFinalAcknowledgementReceipt,
    TransferCompleteRequest,
    TransferCompleteResponse,
    RecoverRequest,
    RecoverResponse,
    RollbackRequest,
    RollbackAck,
    Error,
}

/// Final message of each stage. A stage is complete once its final
/// message's hash is recorded.
pub const STAGE_FINAL_MESSAGES: [MessageType; 4] = [
    MessageType::PreTransferResponse,
    MessageType::TransferCommenceResponse,
    MessageType::LockAssertionReceipt,
    MessageType::TransferCompleteResponse,
];

impl MessageType {
    /// Stage this message belongs to, or `None` for recovery and error
    /// messages.
    pub fn stage(self) -> Option<u8> {
        use MessageType::*;
        match self {
            NewSessionRequest | NewSessionResponse | PreTransferRequest | PreTransferResponse => {
                Some(0)
            }
            TransferProposalRequest
            | TransferProposalReceipt
            | TransferProposalReject
            | TransferCommenceRequest
            | TransferCommenceResponse => Some(1),
            LockAssertionRequest | LockAssertionReceipt => Some(2),
            CommitPreparationRequest
            | CommitReadyResponse
            | CommitFinalAssertionRequest
            | CommitFinalAcknowledgementReceipt
            | TransferCompleteRequest
            | TransferCompleteResponse => Some(3),
            RecoverRequest | RecoverResponse | RollbackRequest | RollbackAck | Error => None,
        }
    }

    /// Message whose hash this message carries in `hash_previous_message`.
    pub fn previous(self) -> Option<MessageType> {
        use MessageType::*;
        match self {
            NewSessionRequest => None,
            NewSessionResponse => Some(NewSessionRequest),
            PreTransferRequest => Some(NewSessionResponse),
            PreTransferResponse => Some(PreTransferRequest),
            TransferProposalRequest => Some(PreTransferResponse),
            TransferProposalReceipt | TransferProposalReject => Some(TransferProposalRequest),
            TransferCommenceRequest => Some(TransferProposalReceipt),
            TransferCommenceResponse => Some(TransferCommenceRequest),
            LockAssertionRequest => Some(TransferCommenceResponse),
            LockAssertionReceipt => Some(LockAssertionRequest),
            CommitPreparationRequest => Some(LockAssertionReceipt),
            CommitReadyResponse => Some(CommitPreparationRequest),
            CommitFinalAssertionRequest => Some(CommitReadyResponse),
            CommitFinalAcknowledgementReceipt => Some(CommitFinalAssertionRequest),
            TransferCompleteRequest => Some(CommitFinalAcknowledgementReceipt),
            TransferCompleteResponse => Some(TransferCompleteRequest),
            RecoverRequest | RecoverResponse | RollbackRequest | RollbackAck | Error => None,
        }
    }

    /// Replies a client accepts for this request type.
    pub fn expected_replies(self) -> &'static [MessageType] {
        use MessageType::*;
        match self {
            NewSessionRequest => &[NewSessionResponse],
            PreTransferRequest => &[PreTransferResponse],
            TransferProposalRequest => &[TransferProposalReceipt, TransferProposalReject],
            TransferCommenceRequest => &[TransferCommenceResponse],
            LockAssertionRequest => &[LockAssertionReceipt],
            CommitPreparationRequest => &[CommitReadyResponse],
            CommitFinalAssertionRequest => &[CommitFinalAcknowledgementReceipt],
            TransferCompleteRequest => &[TransferCompleteResponse],
            RecoverRequest => &[RecoverResponse],
            RollbackRequest => &[RollbackAck],
            _ => &[],
        }
    }

    /// Log type used for entries about this message.
    pub fn log_type(self) -> &'static str {
        use MessageType::*;
        match self {
            NewSessionRequest => "new-session-request",
            NewSessionResponse => "new-session-response",
            PreTransferRequest => "pre-transfer-request",
            PreTransferResponse => "pre-transfer-response",
            TransferProposalRequest => "transfer-proposal-request",
            TransferProposalReceipt => "transfer-proposal-receipt",
            TransferProposalReject => "transfer-proposal-reject",
            TransferCommenceRequest => "transfer-commence-request",
            TransferCommenceResponse => "transfer-commence-response",
            LockAssertionRequest => "lock-assertion-request",
            LockAssertionReceipt => "lock-assertion-receipt",
            CommitPreparationRequest => "commit-preparation-request",
            CommitReadyResponse => "commit-ready-response",
            CommitFinalAssertionRequest => "commit-final-assertion-request",
            CommitFinalAcknowledgementReceipt => "commit-final-acknowledgement-receipt",
            TransferCompleteRequest => "transfer-complete-request",
            TransferCompleteResponse => "transfer-complete-response",
            RecoverRequest => "recover-request",
            RecoverResponse => "recover-response",
            RollbackRequest => "rollback-request",
            RollbackAck => "rollback-ack",
            Error => "error",
        }
    }

    pub fn is_recovery(self) -> bool {
        matches!(
            self,
            MessageType::RecoverRequest
                | MessageType::RecoverResponse
                | MessageType::RollbackRequest
                | MessageType::RollbackAck
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.log_type())
    }
}

// ---------------------------------------------------------------------------
// SatpMessage
// ---------------------------------------------------------------------------

/// The signed envelope exchanged between gateways.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatpMessage {
    pub version: String,
    pub message_type: MessageType,
    pub session_id: String,
    pub context_id: String,
    pub sequence_number: u64,
    pub client_pubkey: GatewayPublicKey,
    pub server_pubkey: GatewayPublicKey,
    /// Id of the gateway that emitted this message. Stamped by the
    /// orchestrator just before signing.
    pub sender_gateway_id: String,
    /// Hex digest of the preceding message, or empty for the first message
    /// and for recovery traffic.
    pub hash_previous_message: String,
    pub payload: Payload,
    pub signature: Option<GatewaySignature>,
}

impl SatpMessage {
    /// Outbound message for the session's current sequence number. The
    /// caller advances the sequence number first.
    pub fn for_session(data: &SessionData, payload: Payload) -> Self {
        let message_type = payload.message_type();
        Self {
            version: config::SATP_VERSION.to_string(),
            message_type,
            session_id: data.id.clone(),
            context_id: data.context_id.clone(),
            sequence_number: data.last_sequence_number,
            client_pubkey: data.client_gateway_pubkey.clone(),
            server_pubkey: data.server_gateway_pubkey.clone(),
            sender_gateway_id: String::new(),
            hash_previous_message: data.previous_hash_for(message_type),
            payload,
            signature: None,
        }
    }

    /// Reply to `request`, echoing its coordinates and chaining its hash.
    pub fn reply_to(request: &SatpMessage, request_hash: String, payload: Payload) -> Self {
        Self {
            version: config::SATP_VERSION.to_string(),
            message_type: payload.message_type(),
            session_id: request.session_id.clone(),
            context_id: request.context_id.clone(),
            sequence_number: request.sequence_number,
            client_pubkey: request.client_pubkey.clone(),
            server_pubkey: request.server_pubkey.clone(),
            sender_gateway_id: String::new(),
            hash_previous_message: request_hash,
            payload,
            signature: None,
        }
    }

    /// Hex SHA-256 of the full signed envelope.
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        hash_object(self)
    }

    /// Version and type/payload agreement.
    pub fn check_shape(&self) -> Result<(), SatpError> {
        if self.version != config::SATP_VERSION {
            return Err(SatpError::Validation(format!(
                "unsupported SATP version {}",
                self.version
            )));
        }
        if self.payload.message_type() != self.message_type {
            return Err(SatpError::Validation(format!(
                "message_type {} does not match payload {}",
                self.message_type,
                self.payload.message_type()
            )));
        }
        Ok(())
    }
}

impl Signable for SatpMessage {
    type View = SatpMessage;

    fn signing_view(&self) -> SatpMessage {
        let mut view = self.clone();
        view.signature = None;
        view
    }

    fn signature(&self) -> Option<&GatewaySignature> {
        self.signature.as_ref()
    }

    fn set_signature(&mut self, signature: GatewaySignature) {
        self.signature = Some(signature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sign_object, verify_object, GatewayKeypair};
    use crate::session::{Role, SessionData, SessionParams};

    fn data() -> SessionData {
        let client = GatewayKeypair::from_seed(&[1; 32]).public_key();
        let server = GatewayKeypair::from_seed(&[2; 32]).public_key();
        SessionData::new(
            "sess-1".into(),
            "ctx-1".into(),
            Role::Client,
            &SessionParams::new(client, server, "besu", "fabric"),
        )
    }

    #[test]
    fn previous_chain_is_total_over_stage_messages() {
        let mut t = MessageType::TransferCompleteResponse;
        let mut steps = 0;
        while let Some(prev) = t.previous() {
            t = prev;
            steps += 1;
        }
        assert_eq!(t, MessageType::NewSessionRequest);
        assert_eq!(steps, 15);
    }

    #[test]
    fn stage_final_messages_have_increasing_stages() {
        let stages: Vec<_> = STAGE_FINAL_MESSAGES.iter().map(|t| t.stage()).collect();
        assert_eq!(stages, vec![Some(0), Some(1), Some(2), Some(3)]);
        assert_eq!(MessageType::RollbackAck.stage(), None);
    }

    #[test]
    fn signature_covers_payload() {
        let kp = GatewayKeypair::from_seed(&[1; 32]);
        let mut msg = SatpMessage::for_session(
            &data(),
            Payload::NewSessionResponse(NewSessionResponse { accepted: true }),
        );
        sign_object(&kp, &mut msg).unwrap();
        assert!(verify_object(&kp.public_key(), &msg));

        msg.payload = Payload::NewSessionResponse(NewSessionResponse { accepted: false });
        assert!(!verify_object(&kp.public_key(), &msg));
    }

    #[test]
    fn json_roundtrip_preserves_hash() {
        let kp = GatewayKeypair::from_seed(&[1; 32]);
        let mut msg = SatpMessage::for_session(
            &data(),
            Payload::LockAssertionRequest(LockAssertionRequest {
                asset_id: "a-1".into(),
                amount: 100,
                lock_tx_id: "tx-9".into(),
            }),
        );
        sign_object(&kp, &mut msg).unwrap();
        let wire = serde_json::to_vec(&msg).unwrap();
        let back: SatpMessage = serde_json::from_slice(&wire).unwrap();
        assert_eq!(back.hash().unwrap(), msg.hash().unwrap());
    }

    #[test]
    fn shape_check_rejects_mismatched_type() {
        let mut msg = SatpMessage::for_session(
            &data(),
            Payload::TransferCommenceRequest(TransferCommenceRequest {}),
        );
        assert!(msg.check_shape().is_ok());
        msg.message_type = MessageType::LockAssertionRequest;
        assert!(matches!(msg.check_shape(), Err(SatpError::Validation(_))));
    }
}
