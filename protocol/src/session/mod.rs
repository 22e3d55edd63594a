//! # Sessions
//!
//! A [`Session`] is the container for one transfer on one gateway. It holds
//! the client-side [`SessionData`] or the server-side one. `Role::Both`
//! holds the two sides in one container, but a gateway is never its own
//! counterparty: the transfer flow refuses a destination network the local
//! gateway serves, so every session it creates or restores from the log is
//! `Client` or `Server`.
//!
//! Sessions live in the SATP manager's active map behind
//! `Arc<parking_lot::Mutex<_>>`. The mutex is only ever held for short,
//! synchronous critical sections and never across an `.await`.
//!
//! Besides the protocol state, a session keeps two in-memory caches used for
//! at-least-once delivery:
//!
//! - the client's **outbox**: the signed request last sent per message type,
//!   so a retry resends the identical message;
//! - the server's **response cache**: the signed reply keyed by the digest of
//!   the request it answered, so a duplicate delivery gets the same reply.
//!
//! Both caches are rebuilt from the log when a session is reconstructed.

pub mod data;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::asset::Asset;
use crate::config::SessionPolicy;
use crate::crypto::GatewayPublicKey;
use crate::log::LocalLog;
use crate::messages::{MessageType, SatpMessage};
use crate::satp::SatpError;

pub use data::{SessionData, SessionState};

/// Shared handle stored in the active-session map.
pub type SharedSession = Arc<Mutex<Session>>;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Client,
    Server,
    Both,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Client => "client",
            Role::Server => "server",
            Role::Both => "both",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// SessionParams
// ---------------------------------------------------------------------------

/// Everything needed to seed a new [`SessionData`].
#[derive(Clone, Debug)]
pub struct SessionParams {
    pub max_retries: u32,
    pub max_timeout_ms: u64,
    pub client_gateway_pubkey: GatewayPublicKey,
    pub server_gateway_pubkey: GatewayPublicKey,
    pub sender_gateway_network_id: String,
    pub recipient_gateway_network_id: String,
    pub sender_asset: Option<Asset>,
    pub receiver_asset: Option<Asset>,
    pub originator: String,
    pub beneficiary: String,
}

impl SessionParams {
    pub fn new(
        client_gateway_pubkey: GatewayPublicKey,
        server_gateway_pubkey: GatewayPublicKey,
        sender_gateway_network_id: impl Into<String>,
        recipient_gateway_network_id: impl Into<String>,
    ) -> Self {
        let policy = SessionPolicy::default();
        Self {
            max_retries: policy.max_retries,
            max_timeout_ms: policy.max_timeout_ms,
            client_gateway_pubkey,
            server_gateway_pubkey,
            sender_gateway_network_id: sender_gateway_network_id.into(),
            recipient_gateway_network_id: recipient_gateway_network_id.into(),
            sender_asset: None,
            receiver_asset: None,
            originator: String::new(),
            beneficiary: String::new(),
        }
    }

    pub fn with_policy(mut self, policy: &SessionPolicy) -> Self {
        self.max_retries = policy.max_retries;
        self.max_timeout_ms = policy.max_timeout_ms;
        self
    }
}

// ---------------------------------------------------------------------------
// SessionRecord
// ---------------------------------------------------------------------------

/// What a log entry's `data` field holds: the session snapshot at the time
/// of writing, plus the signed message the entry is about (client requests
/// on `init`, server replies on `done`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: SessionData,
    #[serde(default)]
    pub message: Option<SatpMessage>,
}

impl SessionRecord {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Session {
    id: String,
    context_id: String,
    role: Role,
    client: Option<SessionData>,
    server: Option<SessionData>,
    outbox: HashMap<MessageType, SatpMessage>,
    responses: HashMap<String, SatpMessage>,
    in_flight: Option<u64>,
    /// Set when the session reached `Completed` or `RolledBack`.
    closed_at: Option<Instant>,
}

impl Session {
    /// New session with a fresh UUIDv4 id.
    pub fn create(context_id: impl Into<String>, role: Role, params: &SessionParams) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), context_id, role, params)
    }

    /// New session under an id chosen by the counterparty.
    pub fn with_id(
        id: impl Into<String>,
        context_id: impl Into<String>,
        role: Role,
        params: &SessionParams,
    ) -> Self {
        let id = id.into();
        let context_id = context_id.into();
        let make = |r: Role| SessionData::new(id.clone(), context_id.clone(), r, params);
        let client = matches!(role, Role::Client | Role::Both).then(|| make(Role::Client));
        let server = matches!(role, Role::Server | Role::Both).then(|| make(Role::Server));
        Self {
            id,
            context_id,
            role,
            client,
            server,
            outbox: HashMap::new(),
            responses: HashMap::new(),
            in_flight: None,
            closed_at: None,
        }
    }

    /// Rebuild a session from one logged snapshot. Each snapshot carries a
    /// single side, so a `Both` snapshot lands in the client slot. A
    /// snapshot that is already closed counts as closed from now on.
    pub fn from_snapshot(data: SessionData) -> Self {
        let mut session = Self {
            id: data.id.clone(),
            context_id: data.context_id.clone(),
            role: data.role,
            client: None,
            server: None,
            outbox: HashMap::new(),
            responses: HashMap::new(),
            in_flight: None,
            closed_at: matches!(data.state, SessionState::Completed | SessionState::RolledBack)
                .then(Instant::now),
        };
        match data.role {
            Role::Server => session.server = Some(data),
            Role::Client | Role::Both => session.client = Some(data),
        }
        session
    }

    /// Rebuild a session from its log, oldest entry first. The newest
    /// snapshot wins; messages found along the way refill the caches.
    /// Returns `None` for an empty log.
    pub fn from_log(entries: &[LocalLog]) -> Result<Option<Self>, SatpError> {
        let mut latest: Option<SessionData> = None;
        let mut messages = Vec::new();
        for entry in entries {
            let record = SessionRecord::from_json(&entry.data)?;
            if let Some(message) = record.message {
                messages.push(message);
            }
            latest = Some(record.session);
        }
        let Some(data) = latest else {
            return Ok(None);
        };
        let is_client = data.role != Role::Server;
        let mut session = Self::from_snapshot(data);
        for message in messages {
            if is_client {
                session.outbox.insert(message.message_type, message);
            } else {
                session
                    .responses
                    .insert(message.hash_previous_message.clone(), message);
            }
        }
        Ok(Some(session))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    // -- Role data -----------------------------------------------------------

    pub fn client_data(&self) -> Result<&SessionData, SatpError> {
        self.client.as_ref().ok_or_else(|| self.unavailable(Role::Client))
    }

    pub fn client_data_mut(&mut self) -> Result<&mut SessionData, SatpError> {
        let err = self.unavailable(Role::Client);
        self.client.as_mut().ok_or(err)
    }

    pub fn server_data(&self) -> Result<&SessionData, SatpError> {
        self.server.as_ref().ok_or_else(|| self.unavailable(Role::Server))
    }

    pub fn server_data_mut(&mut self) -> Result<&mut SessionData, SatpError> {
        let err = self.unavailable(Role::Server);
        self.server.as_mut().ok_or(err)
    }

    /// Data for one side. `Role::Both` resolves to the client side.
    pub fn data(&self, role: Role) -> Result<&SessionData, SatpError> {
        match role {
            Role::Server => self.server_data(),
            Role::Client | Role::Both => self.client_data(),
        }
    }

    pub fn data_mut(&mut self, role: Role) -> Result<&mut SessionData, SatpError> {
        match role {
            Role::Server => self.server_data_mut(),
            Role::Client | Role::Both => self.client_data_mut(),
        }
    }

    /// The side that drives this session: client data when present.
    pub fn primary(&self) -> Result<&SessionData, SatpError> {
        self.client_data().or_else(|_| self.server_data())
    }

    fn unavailable(&self, role: Role) -> SatpError {
        SatpError::SessionDataNotAvailable {
            session_id: self.id.clone(),
            role,
        }
    }

    // -- State ---------------------------------------------------------------

    pub fn state(&self) -> Option<SessionState> {
        self.primary().ok().map(|d| d.state)
    }

    /// Set the state on every side present.
    pub fn set_state(&mut self, state: SessionState) {
        for data in [self.client.as_mut(), self.server.as_mut()].into_iter().flatten() {
            data.state = state;
        }
        let closing = matches!(state, SessionState::Completed | SessionState::RolledBack);
        if closing && self.closed_at.is_none() {
            self.closed_at = Some(Instant::now());
        }
    }

    pub fn is_recovering(&self) -> bool {
        self.state() == Some(SessionState::Recovering)
    }

    /// Completed or rolled back longer ago than `ttl`.
    pub fn closed_for(&self, ttl: Duration) -> bool {
        self.closed_at.map(|t| t.elapsed() >= ttl).unwrap_or(false)
    }

    // -- Delivery caches -----------------------------------------------------

    pub fn outbound(&self, message_type: MessageType) -> Option<&SatpMessage> {
        self.outbox.get(&message_type)
    }

    pub fn remember_outbound(&mut self, message: SatpMessage) {
        self.outbox.insert(message.message_type, message);
    }

    pub fn cached_response(&self, request_hash: &str) -> Option<&SatpMessage> {
        self.responses.get(request_hash)
    }

    pub fn remember_response(&mut self, request_hash: String, response: SatpMessage) {
        self.responses.insert(request_hash, response);
    }

    /// Claim `sequence_number` for processing. Fails if another delivery
    /// of a message is already being handled.
    pub fn begin_inbound(&mut self, sequence_number: u64) -> Result<(), SatpError> {
        if let Some(current) = self.in_flight {
            return Err(SatpError::Rejected(format!(
                "session {} is still processing message {}",
                self.id, current
            )));
        }
        self.in_flight = Some(sequence_number);
        Ok(())
    }

    pub fn end_inbound(&mut self) {
        self.in_flight = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::GatewayKeypair;
    use crate::log::LogOperation;
    use crate::messages::{NewSessionResponse, Payload};

    fn params() -> SessionParams {
        SessionParams::new(
            GatewayKeypair::from_seed(&[1; 32]).public_key(),
            GatewayKeypair::from_seed(&[2; 32]).public_key(),
            "besu",
            "fabric",
        )
    }

    #[test]
    fn create_builds_requested_roles_only() {
        let client = Session::create("ctx", Role::Client, &params());
        assert!(client.client_data().is_ok());
        assert!(matches!(
            client.server_data(),
            Err(SatpError::SessionDataNotAvailable { role: Role::Server, .. })
        ));
        assert_eq!(client.state(), Some(SessionState::Initializing));
        assert!(Uuid::parse_str(client.id()).is_ok());

        let both = Session::create("ctx", Role::Both, &params());
        assert!(both.client_data().is_ok() && both.server_data().is_ok());
    }

    #[test]
    fn set_state_updates_all_sides() {
        let mut s = Session::create("ctx", Role::Both, &params());
        s.set_state(SessionState::Recovering);
        assert!(s.is_recovering());
        assert_eq!(s.server_data().unwrap().state, SessionState::Recovering);
    }

    #[test]
    fn completion_ttl() {
        let mut s = Session::create("ctx", Role::Client, &params());
        assert!(!s.closed_for(Duration::ZERO));
        s.set_state(SessionState::Completed);
        assert!(s.closed_for(Duration::ZERO));
        assert!(!s.closed_for(Duration::from_secs(3600)));
    }

    #[test]
    fn rolled_back_and_restored_sessions_count_as_closed() {
        let mut s = Session::create("ctx", Role::Server, &params());
        s.set_state(SessionState::RolledBack);
        assert!(s.closed_for(Duration::ZERO));

        let mut data = s.server_data().unwrap().clone();
        data.state = SessionState::Completed;
        assert!(Session::from_snapshot(data.clone()).closed_for(Duration::ZERO));

        // A failed session still belongs to recovery.
        data.state = SessionState::Failed;
        assert!(!Session::from_snapshot(data).closed_for(Duration::ZERO));
    }

    #[test]
    fn only_one_inbound_message_at_a_time() {
        let mut s = Session::create("ctx", Role::Server, &params());
        s.begin_inbound(1).unwrap();
        assert!(matches!(s.begin_inbound(1), Err(SatpError::Rejected(_))));
        s.end_inbound();
        s.begin_inbound(2).unwrap();
    }

    #[test]
    fn from_log_restores_latest_snapshot_and_response_cache() {
        let s = Session::with_id("sess", "ctx", Role::Server, &params());
        let mut first = s.server_data().unwrap().clone();
        first.last_sequence_number = 1;
        let mut second = first.clone();
        second.last_sequence_number = 2;
        second.state = SessionState::TransferProposed;

        let mut reply = SatpMessage::for_session(
            &second,
            Payload::NewSessionResponse(NewSessionResponse { accepted: true }),
        );
        reply.hash_previous_message = "req-hash".into();

        let entries = vec![
            LocalLog::new(
                "sess",
                "a",
                LogOperation::Done,
                SessionRecord { session: first, message: None }.to_json().unwrap(),
                1,
            ),
            LocalLog::new(
                "sess",
                "b",
                LogOperation::Done,
                SessionRecord { session: second, message: Some(reply.clone()) }
                    .to_json()
                    .unwrap(),
                2,
            ),
        ];

        let rebuilt = Session::from_log(&entries).unwrap().unwrap();
        assert_eq!(rebuilt.role(), Role::Server);
        assert_eq!(rebuilt.state(), Some(SessionState::TransferProposed));
        assert_eq!(rebuilt.server_data().unwrap().last_sequence_number, 2);
        assert_eq!(rebuilt.cached_response("req-hash"), Some(&reply));
        assert!(Session::from_log(&[]).unwrap().is_none());
    }
}
