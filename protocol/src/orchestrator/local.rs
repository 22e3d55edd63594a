//! In-process gateway network.
//!
//! Routes messages between gateways living in the same process, encoding
//! each message to JSON and back so nothing that would not survive the wire
//! slips through. Faults can be injected per gateway: a gateway can be made
//! unreachable, made to drop particular request types, or made to lose
//! particular replies after handling the request.
//!
//! Handlers are held as `Weak` references. A gateway owns its orchestrator,
//! which owns the network, so strong handles here would form a cycle.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use super::channel::{GatewayChannel, MessageHandler, TransportError};
use crate::identity::GatewayIdentity;
use crate::messages::{MessageType, SatpMessage};

#[derive(Default)]
pub struct LocalNetwork {
    routes: RwLock<HashMap<String, Weak<dyn MessageHandler>>>,
    unreachable: RwLock<HashSet<String>>,
    dropped: RwLock<HashMap<String, HashSet<MessageType>>>,
    lost_replies: RwLock<HashMap<String, HashSet<MessageType>>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, gateway_id: impl Into<String>, handler: &Arc<dyn MessageHandler>) {
        self.routes
            .write()
            .insert(gateway_id.into(), Arc::downgrade(handler));
    }

    pub fn unregister(&self, gateway_id: &str) {
        self.routes.write().remove(gateway_id);
    }

    /// Make `gateway_id` (un)reachable for every sender.
    pub fn set_reachable(&self, gateway_id: &str, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(gateway_id);
        } else {
            unreachable.insert(gateway_id.to_string());
        }
    }

    /// Drop every `message_type` request addressed to `gateway_id`.
    pub fn drop_messages(&self, gateway_id: &str, message_type: MessageType) {
        self.dropped
            .write()
            .entry(gateway_id.to_string())
            .or_default()
            .insert(message_type);
    }

    /// Let `gateway_id` handle requests as usual, but lose every
    /// `reply_type` reply it sends back. The sender sees the gateway as
    /// unreachable.
    pub fn drop_replies(&self, gateway_id: &str, reply_type: MessageType) {
        self.lost_replies
            .write()
            .entry(gateway_id.to_string())
            .or_default()
            .insert(reply_type);
    }

    /// Remove all faults injected for `gateway_id`.
    pub fn heal(&self, gateway_id: &str) {
        self.unreachable.write().remove(gateway_id);
        self.dropped.write().remove(gateway_id);
        self.lost_replies.write().remove(gateway_id);
    }

    fn is_dropped(&self, gateway_id: &str, message_type: MessageType) -> bool {
        Self::listed(&self.dropped, gateway_id, message_type)
    }

    fn is_reply_lost(&self, gateway_id: &str, message_type: MessageType) -> bool {
        Self::listed(&self.lost_replies, gateway_id, message_type)
    }

    fn listed(
        faults: &RwLock<HashMap<String, HashSet<MessageType>>>,
        gateway_id: &str,
        message_type: MessageType,
    ) -> bool {
        faults
            .read()
            .get(gateway_id)
            .map(|types| types.contains(&message_type))
            .unwrap_or(false)
    }
}

#[async_trait]
impl GatewayChannel for LocalNetwork {
    async fn send(
        &self,
        target: &GatewayIdentity,
        message: SatpMessage,
    ) -> Result<SatpMessage, TransportError> {
        if self.unreachable.read().contains(&target.id)
            || self.is_dropped(&target.id, message.message_type)
        {
            return Err(TransportError::Unreachable(target.id.clone()));
        }
        let handler = self
            .routes
            .read()
            .get(&target.id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable(target.id.clone()))?;

        let wire = serde_json::to_vec(&message)?;
        let request: SatpMessage = serde_json::from_slice(&wire)?;
        let reply = handler.handle(request).await;
        if self.is_reply_lost(&target.id, reply.message_type) {
            return Err(TransportError::Unreachable(target.id.clone()));
        }
        let wire = serde_json::to_vec(&reply)?;
        Ok(serde_json::from_slice(&wire)?)
    }
}
