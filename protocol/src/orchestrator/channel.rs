//! Transport seam between gateways.

use async_trait::async_trait;

use crate::identity::GatewayIdentity;
use crate::messages::SatpMessage;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("gateway {0} is unreachable")]
    Unreachable(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("connection closed by peer")]
    Closed,
}

/// Delivers a request to a gateway and returns its reply.
///
/// A channel only moves bytes: it does not sign, verify, retry or time out.
/// Those are the orchestrator's job.
#[async_trait]
pub trait GatewayChannel: Send + Sync {
    async fn send(
        &self,
        target: &GatewayIdentity,
        message: SatpMessage,
    ) -> Result<SatpMessage, TransportError>;
}

/// Receiving end of a gateway. Always answers with a signed message; failures
/// travel back as an `Error` payload.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: SatpMessage) -> SatpMessage;
}
