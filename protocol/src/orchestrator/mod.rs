//! # Gateway Orchestrator
//!
//! Knows every counterparty gateway, signs everything this gateway sends
//! and verifies everything it receives. The known-gateway table is seeded
//! once from configuration and never changes afterwards.
//!
//! The orchestrator performs exactly one round trip per call. Retrying is
//! the SATP manager's business; a bad signature surfaces immediately as
//! [`SatpError::SignatureVerification`].

pub mod channel;
pub mod local;
pub mod tcp;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::crypto::{sign_object, verify_object, GatewayKeypair, GatewayPublicKey};
use crate::identity::GatewayIdentity;
use crate::messages::{Payload, SatpMessage};
use crate::satp::SatpError;
use crate::session::{Role, SessionData};

pub use channel::{GatewayChannel, MessageHandler, TransportError};
pub use local::LocalNetwork;
pub use tcp::{serve_tcp, TcpChannel};

pub struct GatewayOrchestrator {
    local: GatewayIdentity,
    keypair: GatewayKeypair,
    known_gateways: HashMap<String, GatewayIdentity>,
    channel: Arc<dyn GatewayChannel>,
}

impl GatewayOrchestrator {
    /// Fails if `keypair` does not match `local.pubkey`.
    pub fn new(
        local: GatewayIdentity,
        keypair: GatewayKeypair,
        known_gateways: Vec<GatewayIdentity>,
        channel: Arc<dyn GatewayChannel>,
    ) -> Result<Self, SatpError> {
        if keypair.public_key() != local.pubkey {
            return Err(SatpError::Validation(format!(
                "signing key does not match the public key of gateway {}",
                local.id
            )));
        }
        let known_gateways = known_gateways
            .into_iter()
            .filter(|gw| gw.id != local.id)
            .map(|gw| (gw.id.clone(), gw))
            .collect();
        Ok(Self {
            local,
            keypair,
            known_gateways,
            channel,
        })
    }

    pub fn local_identity(&self) -> &GatewayIdentity {
        &self.local
    }

    pub fn public_key(&self) -> GatewayPublicKey {
        self.local.pubkey.clone()
    }

    pub fn keypair(&self) -> &GatewayKeypair {
        &self.keypair
    }

    pub fn known_gateways(&self) -> impl Iterator<Item = &GatewayIdentity> {
        self.known_gateways.values()
    }

    pub fn get_gateway(&self, id: &str) -> Option<&GatewayIdentity> {
        self.known_gateways.get(id)
    }

    pub fn gateway_by_pubkey(&self, pubkey: &GatewayPublicKey) -> Option<&GatewayIdentity> {
        self.known_gateways.values().find(|gw| &gw.pubkey == pubkey)
    }

    /// Known gateway fronting `network_id`. Lowest id wins if several do.
    pub fn gateway_for_network(&self, network_id: &str) -> Option<&GatewayIdentity> {
        self.known_gateways
            .values()
            .filter(|gw| gw.serves_network(network_id))
            .min_by(|a, b| a.id.cmp(&b.id))
    }

    /// The other gateway of a session, resolved from the counterparty's key.
    pub fn get_counterparty(&self, data: &SessionData) -> Result<&GatewayIdentity, SatpError> {
        let pubkey = match data.role {
            Role::Server => &data.client_gateway_pubkey,
            Role::Client | Role::Both => &data.server_gateway_pubkey,
        };
        self.gateway_by_pubkey(pubkey)
            .ok_or_else(|| SatpError::UnknownGateway(pubkey.to_hex()))
    }

    // -- Signing -------------------------------------------------------------

    /// Stamp `message` as sent by this gateway and sign it.
    pub fn sign_message(&self, mut message: SatpMessage) -> Result<SatpMessage, SatpError> {
        message.sender_gateway_id = self.local.id.clone();
        message.signature = None;
        sign_object(&self.keypair, &mut message)?;
        Ok(message)
    }

    pub fn sign_response(&self, response: SatpMessage) -> Result<SatpMessage, SatpError> {
        self.sign_message(response)
    }

    /// Check an inbound request's signature against its sender's key on
    /// file. Returns the sender's identity.
    pub fn verify_inbound(&self, message: &SatpMessage) -> Result<&GatewayIdentity, SatpError> {
        let sender = self
            .known_gateways
            .get(&message.sender_gateway_id)
            .ok_or_else(|| SatpError::UnknownGateway(message.sender_gateway_id.clone()))?;
        if !verify_object(&sender.pubkey, message) {
            warn!(
                gateway = %sender.id,
                session_id = %message.session_id,
                message_type = %message.message_type,
                "inbound signature rejected"
            );
            return Err(SatpError::SignatureVerification(format!(
                "{} from {}",
                message.message_type, sender.id
            )));
        }
        Ok(sender)
    }

    // -- Transport -----------------------------------------------------------

    /// One signed round trip to `target_id`, bounded by `timeout`.
    ///
    /// `message` must already be signed (see [`sign_message`]); it is sent
    /// as-is so that retries put identical bytes on the wire. The reply's
    /// signature is checked against the target's key on file, and `Error`
    /// replies become [`SatpError::Rejected`].
    ///
    /// [`sign_message`]: Self::sign_message
    pub async fn send_message(
        &self,
        target_id: &str,
        message: &SatpMessage,
        timeout: Duration,
    ) -> Result<SatpMessage, SatpError> {
        let target = self
            .known_gateways
            .get(target_id)
            .ok_or_else(|| SatpError::UnknownGateway(target_id.to_string()))?;

        debug!(
            gateway = %target.id,
            session_id = %message.session_id,
            message_type = %message.message_type,
            sequence = message.sequence_number,
            "sending"
        );
        let reply = tokio::time::timeout(timeout, self.channel.send(target, message.clone()))
            .await
            .map_err(|_| SatpError::Timeout(timeout.as_millis() as u64))??;

        if !verify_object(&target.pubkey, &reply) {
            return Err(SatpError::SignatureVerification(format!(
                "{} from {}",
                reply.message_type, target.id
            )));
        }
        if reply.session_id != message.session_id {
            return Err(SatpError::Rejected(format!(
                "reply for session {} to a message of session {}",
                reply.session_id, message.session_id
            )));
        }
        if let Payload::Error(err) = &reply.payload {
            return Err(SatpError::Rejected(format!("{}: {}", err.kind, err.reason)));
        }
        Ok(reply)
    }
}
