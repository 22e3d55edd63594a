//! Stage payloads carried inside a [`SatpMessage`](super::SatpMessage).
//!
//! Each variant of [`Payload`] maps one-to-one onto a [`MessageType`]; the
//! envelope's `message_type` field must agree with the payload it carries.

use serde::{Deserialize, Serialize};

use super::MessageType;
use crate::asset::Asset;
use crate::log::{LocalLog, RemoteLog};

// ---------------------------------------------------------------------------
// Stage 0: Transfer Initialization
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSessionRequest {
    pub sender_gateway_network_id: String,
    pub recipient_gateway_network_id: String,
    pub max_retries: u32,
    pub max_timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSessionResponse {
    pub accepted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreTransferRequest {
    pub sender_asset: Asset,
    pub receiver_asset: Asset,
    pub originator: String,
    pub beneficiary: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreTransferResponse {
    /// Token id of the asset the server wrapped on the destination ledger.
    pub wrapped_token_id: String,
    pub wrap_tx_id: String,
}

// ---------------------------------------------------------------------------
// Stage 1: Transfer Proposal & Commencement
// ---------------------------------------------------------------------------

/// Transfer-init claims. The server checks them against what it learned in
/// stage 0 before accepting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProposalRequest {
    pub originator: String,
    pub beneficiary: String,
    pub sender_gateway_network_id: String,
    pub recipient_gateway_network_id: String,
    pub token_type: String,
    pub amount: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProposalReceipt {
    pub claims_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProposalReject {
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCommenceRequest {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCommenceResponse {}

// ---------------------------------------------------------------------------
// Stage 2: Lock Assertion
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAssertionRequest {
    pub asset_id: String,
    pub amount: u64,
    pub lock_tx_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAssertionReceipt {}

// ---------------------------------------------------------------------------
// Stage 3: Commitment
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPreparationRequest {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReadyResponse {
    pub mint_tx_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFinalAssertionRequest {
    pub burn_tx_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFinalAcknowledgementReceipt {
    pub assign_tx_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCompleteRequest {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCompleteResponse {}

// ---------------------------------------------------------------------------
// Crash Recovery
// ---------------------------------------------------------------------------

/// A local log entry together with its signed digest. The receiver checks
/// that `proof.hash` is the digest of `log` and that the signature is valid
/// before storing the proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedLogEntry {
    pub log: LocalLog,
    pub proof: RemoteLog,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverRequest {
    pub logs: Vec<SignedLogEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverResponse {
    pub logs: Vec<SignedLogEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackAck {
    pub success: bool,
    /// Ledger operations the counterparty compensated (or found already
    /// compensated) while handling the request.
    pub compensated: Vec<String>,
    #[serde(default)]
    pub reason: String,
}

/// Signed negative reply. Carries the failing error's kind so the client can
/// log it; the client treats every error reply as a rejected attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Payload {
    NewSessionRequest(NewSessionRequest),
    NewSessionResponse(NewSessionResponse),
    PreTransferRequest(PreTransferRequest),
    PreTransferResponse(PreTransferResponse),
    TransferProposalRequest(TransferProposalRequest),
    TransferProposalReceipt(TransferProposalReceipt),
    TransferProposalReject(TransferProposalReject),
    TransferCommenceRequest(TransferCommenceRequest),
    TransferCommenceResponse(TransferCommenceResponse),
    LockAssertionRequest(LockAssertionRequest),
    LockAssertionReceipt(LockAssertionReceipt),
    CommitPreparationRequest(CommitPreparationRequest),
    CommitReadyResponse(CommitReadyResponse),
    CommitFinalAssertionRequest(CommitFinalAssertionRequest),
    CommitFinalAcknowledgementReceipt(CommitFinalAcknowledgementReceipt),
    TransferCompleteRequest(TransferCompleteRequest),
    TransferCompleteResponse(TransferCompleteResponse),
    RecoverRequest(RecoverRequest),
    RecoverResponse(RecoverResponse),
    RollbackRequest(RollbackRequest),
    RollbackAck(RollbackAck),
    Error(ErrorReply),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::NewSessionRequest(_) => MessageType::NewSessionRequest,
            Payload::NewSessionResponse(_) => MessageType::NewSessionResponse,
            Payload::PreTransferRequest(_) => MessageType::PreTransferRequest,
            Payload::PreTransferResponse(_) => MessageType::PreTransferResponse,
            Payload::TransferProposalRequest(_) => MessageType::TransferProposalRequest,
            Payload::TransferProposalReceipt(_) => MessageType::TransferProposalReceipt,
            Payload::TransferProposalReject(_) => MessageType::TransferProposalReject,
            Payload::TransferCommenceRequest(_) => MessageType::TransferCommenceRequest,
            Payload::TransferCommenceResponse(_) => MessageType::TransferCommenceResponse,
            Payload::LockAssertionRequest(_) => MessageType::LockAssertionRequest,
            Payload::LockAssertionReceipt(_) => MessageType::LockAssertionReceipt,
            Payload::CommitPreparationRequest(_) => MessageType::CommitPreparationRequest,
            Payload::CommitReadyResponse(_) => MessageType::CommitReadyResponse,
            Payload::CommitFinalAssertionRequest(_) => MessageType::CommitFinalAssertionRequest,
            Payload::CommitFinalAcknowledgementReceipt(_) => {
                MessageType::CommitFinalAcknowledgementReceipt
            }
            Payload::TransferCompleteRequest(_) => MessageType::TransferCompleteRequest,
            Payload::TransferCompleteResponse(_) => MessageType::TransferCompleteResponse,
            Payload::RecoverRequest(_) => MessageType::RecoverRequest,
            Payload::RecoverResponse(_) => MessageType::RecoverResponse,
            Payload::RollbackRequest(_) => MessageType::RollbackRequest,
            Payload::RollbackAck(_) => MessageType::RollbackAck,
            Payload::Error(_) => MessageType::Error,
        }
    }
}
