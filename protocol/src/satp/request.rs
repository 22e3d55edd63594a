//! Requests and views exposed by the gateway's outer surface.

use serde::{Deserialize, Serialize};

use crate::asset::Asset;
use crate::session::{Role, SessionData, SessionState};

/// A request to move `source_amount` of `source_asset` from `sender` to
/// `receiver`, who receives `receiver_amount` of `receiver_asset`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactRequest {
    pub context_id: String,
    pub sender: String,
    pub receiver: String,
    pub source_asset: Asset,
    pub receiver_asset: Asset,
    pub source_amount: u64,
    pub receiver_amount: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactResponse {
    pub session_id: String,
    pub status: SessionState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveAddressResponse {
    pub approve_address: String,
}

/// Read-only summary of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub context_id: String,
    pub role: Role,
    pub state: SessionState,
    pub sender_gateway_network_id: String,
    pub recipient_gateway_network_id: String,
    pub amount: u64,
    pub completed_stages: u8,
    pub last_sequence_number: u64,
    pub retry_count: u32,
    pub created_at_ms: u64,
}

impl From<&SessionData> for SessionStatus {
    fn from(data: &SessionData) -> Self {
        Self {
            session_id: data.id.clone(),
            context_id: data.context_id.clone(),
            role: data.role,
            state: data.state,
            sender_gateway_network_id: data.sender_gateway_network_id.clone(),
            recipient_gateway_network_id: data.recipient_gateway_network_id.clone(),
            amount: data.amount(),
            completed_stages: data.completed_stages(),
            last_sequence_number: data.last_sequence_number,
            retry_count: data.retry_count,
            created_at_ms: data.created_at_ms,
        }
    }
}
