//! # Gateway
//!
//! Composition root of one SATP gateway. A [`Gateway`] wires together the
//! orchestrator, the ledger leafs, the protocol log, the [`SatpManager`]
//! and the [`CrashManager`], and exposes the gateway's outer surface:
//!
//! - [`Gateway::transact`] starts a transfer as client;
//! - [`Gateway::get_approve_address`] tells an asset owner which account to
//!   approve before a transfer;
//! - [`Gateway::session_status`] reads a session back;
//! - [`Gateway::handle_inbound`] (and the [`MessageHandler`] impl) is the
//!   entry point for every gateway-to-gateway message.
//!
//! The managers can be built elsewhere and injected through
//! [`Gateway::new`], which is how the integration tests reach the
//! internals.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{ConfigError, GatewayConfig, RECEIPT_CHANNEL_CAPACITY};
use crate::crosschain::{CrossChainManager, InMemoryLedger, LeafRegistry, LedgerError};
use crate::crypto::GatewayKeypair;
use crate::identity::GatewayIdentity;
use crate::log::{LogError, LogRepository, SledLogStore};
use crate::messages::{ErrorReply, MessageType, Payload, SatpMessage};
use crate::monitor::GatewayMonitor;
use crate::orchestrator::{GatewayChannel, GatewayOrchestrator, MessageHandler};
use crate::recovery::{CrashManager, RecoveryReport};
use crate::satp::{
    ApproveAddressResponse, SatpError, SatpManager, SessionStatus, TransactRequest,
    TransactResponse,
};

/// Errors raised while assembling a gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Satp(#[from] SatpError),

    #[error("log store: {0}")]
    Log(#[from] LogError),

    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub struct Gateway {
    manager: Arc<SatpManager>,
    crash_manager: Arc<CrashManager>,
    monitor: Arc<GatewayMonitor>,
    recovery_enabled: bool,
}

impl Gateway {
    /// Gateway over managers built by the caller. Recovery scheduling is
    /// enabled; use [`Gateway::with_recovery`] to turn it off.
    pub fn new(
        manager: Arc<SatpManager>,
        crash_manager: Arc<CrashManager>,
        monitor: Arc<GatewayMonitor>,
    ) -> Self {
        Self {
            manager,
            crash_manager,
            monitor,
            recovery_enabled: true,
        }
    }

    pub fn with_recovery(mut self, enabled: bool) -> Self {
        self.recovery_enabled = enabled;
        self
    }

    /// Build a gateway from its configuration: one in-memory leaf per
    /// configured ledger, and a sled log under `data_dir` (a temporary one
    /// when unset).
    pub fn from_config(
        config: &GatewayConfig,
        keypair: GatewayKeypair,
        channel: Arc<dyn GatewayChannel>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;

        let mut registry = LeafRegistry::new();
        for ledger in &config.ledgers {
            registry.register(Arc::new(InMemoryLedger::from_config(ledger)));
        }

        let logs: Arc<dyn LogRepository> = match &config.data_dir {
            Some(dir) => Arc::new(SledLogStore::open(dir.join("satp-log"))?),
            None => Arc::new(SledLogStore::open_temporary()?),
        };

        Self::from_parts(config, keypair, channel, registry, logs)
    }

    /// Like [`Gateway::from_config`] but with caller-supplied ledger leafs
    /// and log store.
    pub fn from_parts(
        config: &GatewayConfig,
        keypair: GatewayKeypair,
        channel: Arc<dyn GatewayChannel>,
        registry: LeafRegistry,
        logs: Arc<dyn LogRepository>,
    ) -> Result<Self, GatewayError> {
        let monitor = Arc::new(GatewayMonitor::new(config.identity.id.clone())?);
        let orchestrator = Arc::new(GatewayOrchestrator::new(
            config.identity.clone(),
            keypair,
            config.known_gateways.clone(),
            channel,
        )?);

        let (ledgers, mut receipts) =
            CrossChainManager::new(registry).with_receipt_channel(RECEIPT_CHANNEL_CAPACITY);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let gateway_id = config.identity.id.clone();
            handle.spawn(async move {
                while let Some(receipt) = receipts.recv().await {
                    tracing::debug!(
                        gateway = %gateway_id,
                        ledger = %receipt.ledger_id,
                        operation = %receipt.operation,
                        tx_id = %receipt.tx_id,
                        "ledger receipt"
                    );
                }
            });
        }

        let manager = Arc::new(SatpManager::new(
            orchestrator,
            Arc::new(ledgers),
            logs,
            monitor.clone(),
            config.session.clone(),
            config.completed_session_ttl(),
        ));
        let crash_manager = Arc::new(CrashManager::new(
            manager.clone(),
            monitor.clone(),
            config.recovery.scan_interval(),
        ));

        Ok(Self::new(manager, crash_manager, monitor).with_recovery(config.recovery.enabled))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn identity(&self) -> &GatewayIdentity {
        self.manager.orchestrator().local_identity()
    }

    pub fn manager(&self) -> &Arc<SatpManager> {
        &self.manager
    }

    pub fn crash_manager(&self) -> &Arc<CrashManager> {
        &self.crash_manager
    }

    pub fn monitor(&self) -> &Arc<GatewayMonitor> {
        &self.monitor
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the monitor, run one recovery pass over whatever the log left
    /// behind, then start the periodic scan.
    pub async fn startup(&self) -> Result<RecoveryReport, SatpError> {
        self.monitor.init();
        if !self.recovery_enabled {
            info!(gateway = %self.identity().id, "gateway started (recovery disabled)");
            return Ok(RecoveryReport::default());
        }
        let report = self.crash_manager.check_and_resolve_crashes().await?;
        self.crash_manager.start_scheduler().await;
        info!(
            gateway = %self.identity().id,
            detected = report.detected.len(),
            rolled_forward = report.rolled_forward.len(),
            rolled_back = report.rolled_back.len(),
            "gateway started"
        );
        Ok(report)
    }

    /// Stop the scan, flush the log and stop the monitor. Safe to call
    /// more than once.
    pub async fn shutdown(&self) -> Result<(), SatpError> {
        self.crash_manager.stop_scheduler().await;
        self.manager.logs().flush()?;
        self.monitor.shutdown();
        info!(gateway = %self.identity().id, "gateway stopped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outer surface
    // -----------------------------------------------------------------------

    pub async fn transact(&self, request: TransactRequest) -> Result<TransactResponse, SatpError> {
        self.manager.transact(request).await
    }

    pub async fn get_approve_address(
        &self,
        network_id: &str,
        token_type: &str,
    ) -> Result<ApproveAddressResponse, SatpError> {
        let approve_address = self
            .manager
            .ledgers()
            .approve_address(network_id, token_type)
            .await
            .map_err(|e| match e {
                LedgerError::UnknownLedger(id) => {
                    SatpError::Validation(format!("network {} is not served here", id))
                }
                other => SatpError::Ledger(other),
            })?;
        Ok(ApproveAddressResponse { approve_address })
    }

    pub fn session_status(&self, session_id: &str) -> Result<SessionStatus, SatpError> {
        self.manager.session_status(session_id)
    }

    pub fn sessions_by_context(&self, context_id: &str) -> Vec<SessionStatus> {
        self.manager.sessions_by_context(context_id)
    }

    /// Route one inbound message. Recovery traffic goes to the crash
    /// manager, everything else to the SATP manager.
    pub async fn handle_inbound(&self, message: SatpMessage) -> Result<SatpMessage, SatpError> {
        match message.message_type {
            MessageType::RecoverRequest => self.crash_manager.handle_recover_request(&message).await,
            MessageType::RollbackRequest => {
                self.crash_manager.handle_rollback_request(&message).await
            }
            _ => self.manager.handle_message(message).await,
        }
    }

    /// Signed `Error` reply for a request that could not be served. Falls
    /// back to an unsigned reply if signing itself fails; the client
    /// rejects those like any other error.
    fn error_reply(&self, request: &SatpMessage, err: &SatpError) -> SatpMessage {
        let request_hash = request.hash().unwrap_or_default();
        let reply = SatpMessage::reply_to(
            request,
            request_hash,
            Payload::Error(ErrorReply {
                kind: err.kind().to_string(),
                reason: err.to_string(),
            }),
        );
        match self.manager.orchestrator().sign_response(reply.clone()) {
            Ok(signed) => signed,
            Err(e) => {
                warn!(session_id = %request.session_id, "failed to sign error reply: {}", e);
                reply
            }
        }
    }
}

#[async_trait]
impl MessageHandler for Gateway {
    async fn handle(&self, message: SatpMessage) -> SatpMessage {
        match self.handle_inbound(message.clone()).await {
            Ok(reply) => reply,
            Err(e) => {
                self.monitor.record_message("sent", MessageType::Error);
                self.error_reply(&message, &e)
            }
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("id", &self.identity().id)
            .field("active_sessions", &self.manager.active_session_count())
            .field("recovery_enabled", &self.recovery_enabled)
            .finish()
    }
}
