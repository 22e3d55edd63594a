//! # TCP Transport
//!
//! Gateway-to-gateway messages over plain tokio TCP. Each frame is a 4-byte
//! big-endian length followed by that many bytes of JSON:
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (BE)  | SatpMessage as JSON (len) |
//! +----------------+---------------------------+
//! ```
//!
//! The client side opens one connection per request. The listening side
//! answers any number of frames per connection until the peer hangs up.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::channel::{GatewayChannel, MessageHandler, TransportError};
use crate::config;
use crate::identity::GatewayIdentity;
use crate::messages::SatpMessage;

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    limit: usize,
) -> Result<(), TransportError> {
    if payload.len() > limit {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            limit,
        });
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A clean EOF before the length prefix is
/// [`TransportError::Closed`].
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> Result<Vec<u8>, TransportError> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(e) => return Err(e.into()),
    }
    let size = u32::from_be_bytes(len) as usize;
    if size > limit {
        return Err(TransportError::FrameTooLarge { size, limit });
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TcpChannel {
    max_frame_size: usize,
}

impl Default for TcpChannel {
    fn default() -> Self {
        Self {
            max_frame_size: config::MAX_FRAME_SIZE,
        }
    }
}

impl TcpChannel {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

#[async_trait]
impl GatewayChannel for TcpChannel {
    async fn send(
        &self,
        target: &GatewayIdentity,
        message: SatpMessage,
    ) -> Result<SatpMessage, TransportError> {
        let endpoint = target.server_endpoint();
        let mut stream = TcpStream::connect(&endpoint).await.map_err(|e| {
            debug!(gateway = %target.id, %endpoint, "connect failed: {}", e);
            TransportError::Unreachable(target.id.clone())
        })?;
        let body = serde_json::to_vec(&message)?;
        write_frame(&mut stream, &body, self.max_frame_size).await?;
        let reply = read_frame(&mut stream, self.max_frame_size).await?;
        Ok(serde_json::from_slice(&reply)?)
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Accept gateway connections on `listener` until `shutdown` flips to
/// `true` or its sender is dropped.
pub async fn serve_tcp(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "gateway listener started");
    }
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    match serve_connection(stream, handler).await {
                        Ok(()) | Err(TransportError::Closed) => {}
                        Err(e) => debug!(%peer, "gateway connection ended: {}", e),
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!("gateway listener stopped");
    Ok(())
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<dyn MessageHandler>,
) -> Result<(), TransportError> {
    loop {
        let frame = match read_frame(&mut stream, config::MAX_FRAME_SIZE).await {
            Ok(frame) => frame,
            Err(TransportError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        let request: SatpMessage = serde_json::from_slice(&frame)?;
        let reply = handler.handle(request).await;
        let body = serde_json::to_vec(&reply)?;
        write_frame(&mut stream, &body, config::MAX_FRAME_SIZE).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::GatewayKeypair;
    use crate::messages::{MessageType, Payload, TransferCompleteRequest, TransferCompleteResponse};
    use crate::session::{Role, SessionData, SessionParams};

    struct Complete;

    #[async_trait]
    impl MessageHandler for Complete {
        async fn handle(&self, message: SatpMessage) -> SatpMessage {
            SatpMessage::reply_to(
                &message,
                "prev".into(),
                Payload::TransferCompleteResponse(TransferCompleteResponse {}),
            )
        }
    }

    fn identity(port: u16) -> GatewayIdentity {
        GatewayIdentity {
            id: "gw-b".into(),
            name: "B".into(),
            pubkey: GatewayKeypair::from_seed(&[2; 32]).public_key(),
            signing_algorithm: "Ed25519".into(),
            connected_ledgers: vec![],
            address: "127.0.0.1".into(),
            server_port: port,
            client_port: 0,
            oapi_port: 0,
        }
    }

    fn request() -> SatpMessage {
        let params = SessionParams::new(
            GatewayKeypair::from_seed(&[1; 32]).public_key(),
            GatewayKeypair::from_seed(&[2; 32]).public_key(),
            "besu",
            "fabric",
        );
        let data = SessionData::new("s".into(), "c".into(), Role::Client, &params);
        SatpMessage::for_session(&data, Payload::TransferCompleteRequest(TransferCompleteRequest {}))
    }

    #[tokio::test]
    async fn frame_roundtrip_and_limits() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello", 16).await.unwrap();
        assert_eq!(read_frame(&mut b, 16).await.unwrap(), b"hello");

        assert!(matches!(
            write_frame(&mut a, &[0u8; 32], 16).await,
            Err(TransportError::FrameTooLarge { size: 32, limit: 16 })
        ));

        drop(a);
        assert!(matches!(read_frame(&mut b, 16).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn request_reply_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(serve_tcp(listener, Arc::new(Complete), stop_rx));

        let reply = TcpChannel::default()
            .send(&identity(port), request())
            .await
            .unwrap();
        assert_eq!(reply.message_type, MessageType::TransferCompleteResponse);
        assert_eq!(reply.session_id, "s");

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(matches!(
            TcpChannel::default().send(&identity(port), request()).await,
            Err(TransportError::Unreachable(_))
        ));
    }
}
