//! # Crash Manager
//!
//! Scans the log on a fixed interval for sessions that stopped making
//! progress and resolves them: finishing transfers that are past the point
//! of no return, and compensating the ledger effects of those that are not.
//!
//! A session taken over here is marked `Recovering`. The SATP manager's
//! retry loop and the server admission path both back off from such a
//! session, so the state doubles as a write lock between the two.
//!
//! The scheduler is a tokio task stopped through a `watch` channel, in the
//! style of the block production loop this crate grew out of:
//!
//! ```text
//!   start_scheduler ──▶ loop { check_and_resolve_crashes; sleep | shutdown }
//!   stop_scheduler  ──▶ send(true) ──▶ await task
//! ```

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::plan::{plan_client, plan_server, LogFootprint, RecoveryPlan};
use crate::config::MAX_COMPENSATION_ATTEMPTS;
use crate::crosschain::{LedgerEffect, Receipt};
use crate::identity::GatewayIdentity;
use crate::log::{
    rollback_log_type, LocalLog, LogOperation, RemoteLog, LOG_TYPE_RECOVERY, LOG_TYPE_ROLLBACK,
    LOG_TYPE_TRANSFER_COMPLETE,
};
use crate::messages::{
    Payload, RecoverRequest, RecoverResponse, RollbackAck, RollbackRequest, SatpMessage,
    SignedLogEntry,
};
use crate::monitor::GatewayMonitor;
use crate::satp::{SatpError, SatpManager};
use crate::session::{Role, SessionData, SessionRecord, SessionState, SharedSession};

/// Outcome of one scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sessions newly taken over during this scan.
    pub detected: Vec<String>,
    pub rolled_forward: Vec<String>,
    pub rolled_back: Vec<String>,
    /// Closed without any ledger effect to undo.
    pub dropped: Vec<String>,
    /// Still tracked; retried on the next scan.
    pub pending: Vec<String>,
}

/// How one tracked session was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    RolledForward,
    RolledBack,
    Dropped,
    Pending,
}

struct Scheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct CrashManager {
    manager: Arc<SatpManager>,
    monitor: Arc<GatewayMonitor>,
    scan_interval: Duration,
    tracked: Mutex<HashSet<String>>,
    /// Sessions whose log already ends in a terminal entry; scans skip them.
    closed: Mutex<HashSet<String>>,
    scheduler: tokio::sync::Mutex<Option<Scheduler>>,
}

impl CrashManager {
    pub fn new(manager: Arc<SatpManager>, monitor: Arc<GatewayMonitor>, scan_interval: Duration) -> Self {
        Self {
            manager,
            monitor,
            scan_interval,
            tracked: Mutex::new(HashSet::new()),
            closed: Mutex::new(HashSet::new()),
            scheduler: tokio::sync::Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<SatpManager> {
        &self.manager
    }

    /// Sessions currently owned by recovery.
    pub fn tracked_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tracked.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_tracked(&self, session_id: &str) -> bool {
        self.tracked.lock().contains(session_id)
    }

    // -----------------------------------------------------------------------
    // Scheduler
    // -----------------------------------------------------------------------

    /// Start the periodic scan. A second call while running does nothing.
    pub async fn start_scheduler(self: &Arc<Self>) {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_some() {
            return;
        }
        let (shutdown, mut rx) = watch::channel(false);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(interval_ms = this.scan_interval.as_millis() as u64, "crash scheduler started");
            loop {
                if *rx.borrow() {
                    break;
                }
                match this.check_and_resolve_crashes().await {
                    Ok(report) if report != RecoveryReport::default() => {
                        info!(
                            detected = report.detected.len(),
                            rolled_forward = report.rolled_forward.len(),
                            rolled_back = report.rolled_back.len(),
                            dropped = report.dropped.len(),
                            pending = report.pending.len(),
                            "crash scan"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "crash scan failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(this.scan_interval) => {}
                    _ = rx.changed() => {}
                }
            }
            info!("crash scheduler stopped");
        });
        *scheduler = Some(Scheduler { shutdown, handle });
    }

    /// Stop the periodic scan and wait for the task to finish. Safe to call
    /// when the scheduler was never started, and more than once.
    pub async fn stop_scheduler(&self) {
        let Some(scheduler) = self.scheduler.lock().await.take() else {
            return;
        };
        let _ = scheduler.shutdown.send(true);
        if let Err(e) = scheduler.handle.await {
            error!("crash scheduler task ended abnormally: {}", e);
        }
    }

    pub async fn is_scheduler_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    // -----------------------------------------------------------------------
    // Scan
    // -----------------------------------------------------------------------

    /// One full pass: prune closed sessions, take over stale or failed
    /// ones, then try to resolve every tracked session.
    pub async fn check_and_resolve_crashes(&self) -> Result<RecoveryReport, SatpError> {
        self.manager.prune_completed();
        let mut report = RecoveryReport {
            detected: self.recover_sessions()?,
            ..Default::default()
        };

        for session_id in self.tracked_sessions() {
            let session = match self.manager.find_session(&session_id) {
                Ok(session) => session,
                Err(e) => {
                    warn!(session_id = %session_id, "tracked session unavailable: {}", e);
                    report.pending.push(session_id);
                    continue;
                }
            };
            let primary = session.lock().primary().map(|d| d.clone());
            let data = match primary {
                Ok(data) => data,
                Err(e) => {
                    warn!(session_id = %session_id, "tracked session has no data: {}", e);
                    report.pending.push(session_id);
                    continue;
                }
            };
            let is_client = data.role != Role::Server;
            match self.resolve(&session, &data, is_client).await {
                Ok(Resolution::RolledForward) => report.rolled_forward.push(session_id),
                Ok(Resolution::RolledBack) => report.rolled_back.push(session_id),
                Ok(Resolution::Dropped) => report.dropped.push(session_id),
                Ok(Resolution::Pending) => report.pending.push(session_id),
                Err(e) => {
                    warn!(session_id = %session_id, kind = e.kind(), "recovery attempt failed: {}", e);
                    report.pending.push(session_id);
                }
            }
        }
        Ok(report)
    }

    /// Take over sessions that are failed or stale and not yet closed by a
    /// terminal log entry. Candidates are the active sessions plus every
    /// session in the log. A session that cannot be read is skipped for
    /// this scan. Returns the ids newly tracked.
    pub fn recover_sessions(&self) -> Result<Vec<String>, SatpError> {
        let mut candidates: HashSet<String> = self.manager.active_session_ids().into_iter().collect();
        candidates.extend(self.manager.logs().session_ids()?);

        let now = crate::now_ms();
        let mut detected = Vec::new();
        for session_id in candidates {
            if self.is_tracked(&session_id) || self.closed.lock().contains(&session_id) {
                continue;
            }
            match self.take_over_if_stalled(&session_id, now) {
                Ok(true) => detected.push(session_id),
                Ok(false) => {}
                Err(e) => warn!(
                    session_id = %session_id,
                    kind = e.kind(),
                    "skipping unreadable session: {}",
                    e
                ),
            }
        }
        detected.sort();
        Ok(detected)
    }

    /// Track `session_id` if its log shows a failure or no progress within
    /// the session's timeout. Returns whether it was taken over.
    fn take_over_if_stalled(&self, session_id: &str, now: u64) -> Result<bool, SatpError> {
        let entries = self.manager.logs().read_by_session(session_id)?;
        let Some(last) = entries.last() else {
            return Ok(false);
        };
        let footprint = LogFootprint::from_entries(&entries);
        if footprint.is_terminal() {
            self.closed.lock().insert(session_id.to_string());
            return Ok(false);
        }
        let max_timeout_ms = SessionRecord::from_json(&last.data)?.session.max_timeout_ms;
        let stale = now.saturating_sub(footprint.last_timestamp_ms) >= max_timeout_ms;
        if !footprint.failed && !stale {
            return Ok(false);
        }

        let session = self.manager.find_session(session_id)?;
        let snapshot = {
            let mut guard = session.lock();
            guard.set_state(SessionState::Recovering);
            guard.primary().map(|d| d.clone())
        };
        if let Ok(data) = snapshot {
            self.manager
                .log_step(&data, LOG_TYPE_RECOVERY, LogOperation::Init, None)?;
        }
        self.tracked.lock().insert(session_id.to_string());
        self.monitor.recoveries.inc();
        info!(
            session_id = %session_id,
            failed = footprint.failed,
            stale,
            "session taken over by recovery"
        );
        Ok(true)
    }

    /// Resolve one session, rolling it back, forward, or dropping it.
    /// Returns `false` if it could not be resolved this time; the session
    /// then stays tracked for the next scan.
    pub async fn initiate_rollback(&self, session: &SharedSession, data: &SessionData, is_client: bool) -> bool {
        match self.resolve(session, data, is_client).await {
            Ok(resolution) => resolution != Resolution::Pending,
            Err(e) => {
                warn!(session_id = %data.id, "recovery attempt failed: {}", e);
                false
            }
        }
    }

    async fn resolve(
        &self,
        session: &SharedSession,
        data: &SessionData,
        is_client: bool,
    ) -> Result<Resolution, SatpError> {
        let role = if is_client { Role::Client } else { Role::Server };
        let entries = self.manager.logs().read_by_session(&data.id)?;
        let local = LogFootprint::from_entries(&entries);
        if local.is_terminal() {
            self.close(&data.id);
            return Ok(Resolution::Dropped);
        }

        let remote = match self.exchange_logs(data, entries).await {
            Ok(logs) => Some(LogFootprint::from_entries(&logs)),
            Err(e) => {
                debug!(session_id = %data.id, "log exchange failed: {}", e);
                None
            }
        };
        let plan = if is_client {
            plan_client(&local, remote.as_ref())
        } else {
            plan_server(&local, remote.as_ref())
        };
        info!(session_id = %data.id, role = %role, plan = ?plan, "recovery plan");

        match plan {
            RecoveryPlan::RollForward => self.roll_forward(session, data, role).await,
            RecoveryPlan::Compensate => self.compensate_all(session, data, role, &local).await,
            RecoveryPlan::Drop => {
                self.finish_rollback(session, role)?;
                Ok(Resolution::Dropped)
            }
            RecoveryPlan::Undecided => Ok(Resolution::Pending),
        }
    }

    // -----------------------------------------------------------------------
    // Roll forward
    // -----------------------------------------------------------------------

    async fn roll_forward(
        &self,
        session: &SharedSession,
        data: &SessionData,
        role: Role,
    ) -> Result<Resolution, SatpError> {
        // Lift the recovery lock so the manager's retry loop runs.
        session.lock().set_state(SessionState::CommitPreparing);
        let result = match role {
            Role::Server => self.assign_and_complete(session, data).await,
            Role::Client | Role::Both => self.manager.resume_commit(session).await,
        };
        if let Err(e) = result {
            session.lock().set_state(SessionState::Recovering);
            return Err(e);
        }
        self.monitor.roll_forwards.inc();
        self.manager.remove_session(&data.id);
        self.close(&data.id);
        info!(session_id = %data.id, "session rolled forward");
        Ok(Resolution::RolledForward)
    }

    /// Server-side roll forward: assign the minted funds (a replay if that
    /// already happened) and close the session.
    async fn assign_and_complete(&self, session: &SharedSession, data: &SessionData) -> Result<(), SatpError> {
        let asset = data.receiver_asset.as_ref().ok_or_else(|| {
            SatpError::Transact(format!("session {} has no receiver asset", data.id))
        })?;
        let effect = LedgerEffect::Assign {
            asset_id: asset.token_id.clone(),
            owner: data.beneficiary.clone(),
            amount: asset.amount,
        };
        self.manager
            .ledger_step(session, Role::Server, &data.recipient_gateway_network_id, effect, None)
            .await?;
        self.manager
            .commit(session, Role::Server, LOG_TYPE_TRANSFER_COMPLETE, None, |d| {
                d.state = SessionState::Completed;
                Ok(())
            })?;
        session.lock().set_state(SessionState::Completed);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rollback
    // -----------------------------------------------------------------------

    /// Counterparty first, then this side's open effect.
    async fn compensate_all(
        &self,
        session: &SharedSession,
        data: &SessionData,
        role: Role,
        local: &LogFootprint,
    ) -> Result<Resolution, SatpError> {
        self.manager
            .log_step(data, LOG_TYPE_ROLLBACK, LogOperation::Init, None)?;

        match self.request_rollback(data, "recovery").await {
            Ok(ack) if ack.success => {
                debug!(session_id = %data.id, compensated = ?ack.compensated, "counterparty rolled back");
            }
            Ok(ack) => {
                warn!(session_id = %data.id, "counterparty refused rollback: {}", ack.reason);
                return Ok(Resolution::Pending);
            }
            // Without a commit request the server cannot have minted, so
            // the client may undo its lock alone.
            Err(e) if role != Role::Server && !local.commit_requested => {
                debug!(session_id = %data.id, "counterparty unreachable, rolling back locally: {}", e);
            }
            Err(e) => {
                warn!(session_id = %data.id, "rollback not confirmed by counterparty: {}", e);
                return Ok(Resolution::Pending);
            }
        }

        self.undo_local(session, data, role, local).await?;
        self.finish_rollback(session, role)?;
        Ok(Resolution::RolledBack)
    }

    /// Compensate this side's open ledger effect, if any. Returns the
    /// names of the compensations applied.
    async fn undo_local(
        &self,
        session: &SharedSession,
        data: &SessionData,
        role: Role,
        local: &LogFootprint,
    ) -> Result<Vec<String>, SatpError> {
        let mut compensated = Vec::new();
        match role {
            Role::Server => {
                if local.mint_started && !local.mint_compensated {
                    if let Some(asset) = &data.receiver_asset {
                        let effect = LedgerEffect::Burn {
                            asset_id: asset.token_id.clone(),
                            amount: asset.amount,
                        };
                        self.compensate(session, role, &data.recipient_gateway_network_id, effect)
                            .await?;
                        compensated.push("burn".to_string());
                    }
                }
            }
            Role::Client | Role::Both => {
                if local.lock_started && !local.unlocked {
                    if let Some(asset) = &data.sender_asset {
                        let effect = LedgerEffect::Unlock {
                            asset_id: asset.token_id.clone(),
                            amount: asset.amount,
                        };
                        self.compensate(session, role, &data.sender_gateway_network_id, effect)
                            .await?;
                        compensated.push("unlock".to_string());
                    }
                }
            }
        }
        Ok(compensated)
    }

    /// Run one compensating ledger call between `rollback-{op}` entries.
    /// The session is `Recovering`, so this has its own small retry loop.
    async fn compensate(
        &self,
        session: &SharedSession,
        role: Role,
        network_id: &str,
        effect: LedgerEffect,
    ) -> Result<Receipt, SatpError> {
        let log_type = rollback_log_type(effect.operation());
        self.manager
            .log_current(session, role, &log_type, LogOperation::Init)?;

        let policy = self.manager.policy().clone();
        let mut attempt = 0;
        let receipt = loop {
            attempt += 1;
            match self
                .manager
                .ledgers()
                .apply(network_id, &effect, policy.attempt_timeout())
                .await
            {
                Ok(receipt) => break receipt,
                Err(e) if attempt < MAX_COMPENSATION_ATTEMPTS => {
                    warn!(
                        operation = %effect.operation(),
                        asset_id = %effect.asset_id(),
                        attempt,
                        "compensation failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let tx_id = receipt.tx_id.clone();
        self.manager.commit(session, role, &log_type, None, |d| {
            d.receipts.insert(log_type.clone(), tx_id.clone());
            Ok(())
        })?;
        info!(
            operation = %effect.operation(),
            asset_id = %effect.asset_id(),
            no_op = receipt.no_op,
            "compensation applied"
        );
        Ok(receipt)
    }

    /// Close a session as rolled back and let go of it.
    fn finish_rollback(&self, session: &SharedSession, role: Role) -> Result<(), SatpError> {
        self.manager.commit(session, role, LOG_TYPE_ROLLBACK, None, |d| {
            d.state = SessionState::RolledBack;
            Ok(())
        })?;
        let session_id = {
            let mut guard = session.lock();
            guard.set_state(SessionState::RolledBack);
            guard.id().to_string()
        };
        self.manager.remove_session(&session_id);
        self.close(&session_id);
        self.monitor.rollbacks.inc();
        info!(session_id = %session_id, "session rolled back");
        Ok(())
    }

    fn close(&self, session_id: &str) {
        self.tracked.lock().remove(session_id);
        self.closed.lock().insert(session_id.to_string());
    }

    // -----------------------------------------------------------------------
    // Counterparty exchanges
    // -----------------------------------------------------------------------

    fn counterparty(&self, data: &SessionData) -> Result<GatewayIdentity, SatpError> {
        Ok(self.manager.orchestrator().get_counterparty(data)?.clone())
    }

    /// Only the gateway on the other side of a session may exchange logs
    /// for it or ask for its rollback.
    fn check_counterparty(&self, data: &SessionData, sender: &GatewayIdentity) -> Result<(), SatpError> {
        let counterparty = self.counterparty(data)?;
        if counterparty.pubkey != sender.pubkey {
            warn!(
                session_id = %data.id,
                from = %sender.id,
                counterparty = %counterparty.id,
                "recovery message from outside the session"
            );
            return Err(SatpError::Validation(format!(
                "gateway {} is not the counterparty of session {}",
                sender.id, data.id
            )));
        }
        Ok(())
    }

    /// This gateway's side of a session without activating it: the active
    /// copy, else the newest logged snapshot.
    fn known_session(&self, session_id: &str) -> Result<Option<SessionData>, SatpError> {
        if let Some(session) = self.manager.get_session(session_id) {
            return Ok(Some(session.lock().primary()?.clone()));
        }
        let entries = self.manager.logs().read_by_session(session_id)?;
        match entries.last() {
            Some(last) => Ok(Some(SessionRecord::from_json(&last.data)?.session)),
            None => Ok(None),
        }
    }

    fn sign_entries(&self, entries: Vec<LocalLog>) -> Result<Vec<SignedLogEntry>, SatpError> {
        let keypair = self.manager.orchestrator().keypair();
        entries
            .into_iter()
            .map(|log| {
                let proof = RemoteLog::sign(&log, keypair)?;
                Ok(SignedLogEntry { log, proof })
            })
            .collect()
    }

    /// Check the counterparty's signed entries for `session_id` and keep
    /// their proofs.
    fn accept_entries(
        &self,
        session_id: &str,
        signer: &GatewayIdentity,
        entries: &[SignedLogEntry],
    ) -> Result<(), SatpError> {
        for entry in entries {
            if entry.log.session_id != session_id {
                return Err(SatpError::Validation(format!(
                    "log entry {} does not belong to session {}",
                    entry.log.key, session_id
                )));
            }
            if !entry.proof.verify(&entry.log, &signer.pubkey) {
                return Err(SatpError::SignatureVerification(format!(
                    "log entry {} from {}",
                    entry.log.key, signer.id
                )));
            }
            self.manager.logs().append_remote(&entry.proof)?;
        }
        Ok(())
    }

    /// Send our signed log for the session and return the counterparty's,
    /// after checking and storing its proofs.
    async fn exchange_logs(&self, data: &SessionData, entries: Vec<LocalLog>) -> Result<Vec<LocalLog>, SatpError> {
        let target = self.counterparty(data)?;
        let request = RecoverRequest {
            logs: self.sign_entries(entries)?,
        };
        let reply = self
            .send_recovery(&target, data, Payload::RecoverRequest(request))
            .await?;
        let Payload::RecoverResponse(response) = reply.payload else {
            return Err(SatpError::Rejected(format!(
                "unexpected {} in reply to recover-request",
                reply.message_type
            )));
        };
        self.accept_entries(&data.id, &target, &response.logs)?;
        Ok(response.logs.into_iter().map(|e| e.log).collect())
    }

    async fn request_rollback(&self, data: &SessionData, reason: &str) -> Result<RollbackAck, SatpError> {
        let target = self.counterparty(data)?;
        let request = RollbackRequest {
            reason: reason.to_string(),
        };
        let reply = self
            .send_recovery(&target, data, Payload::RollbackRequest(request))
            .await?;
        match reply.payload {
            Payload::RollbackAck(ack) => Ok(ack),
            _ => Err(SatpError::Rejected(format!(
                "unexpected {} in reply to rollback-request",
                reply.message_type
            ))),
        }
    }

    /// Recovery traffic sits outside the hash chain and sequence checks.
    async fn send_recovery(
        &self,
        target: &GatewayIdentity,
        data: &SessionData,
        payload: Payload,
    ) -> Result<SatpMessage, SatpError> {
        let orchestrator = self.manager.orchestrator();
        let message = orchestrator.sign_message(SatpMessage::for_session(data, payload))?;
        self.monitor.record_message("sent", message.message_type);
        orchestrator
            .send_message(&target.id, &message, self.manager.policy().attempt_timeout())
            .await
    }

    // -----------------------------------------------------------------------
    // Inbound recovery messages
    // -----------------------------------------------------------------------

    /// Answer a counterparty's `RecoverRequest` with this gateway's signed
    /// log for the session, storing the proofs it sent.
    pub async fn handle_recover_request(&self, message: &SatpMessage) -> Result<SatpMessage, SatpError> {
        let orchestrator = self.manager.orchestrator();
        let sender = orchestrator.verify_inbound(message)?.clone();
        self.monitor.record_message("received", message.message_type);
        let Payload::RecoverRequest(request) = &message.payload else {
            return Err(SatpError::Validation(format!(
                "expected recover-request, got {}",
                message.message_type
            )));
        };
        match self.known_session(&message.session_id)? {
            Some(data) => {
                self.check_counterparty(&data, &sender)?;
                self.accept_entries(&message.session_id, &sender, &request.logs)?;
            }
            // Nothing to check the sender against: answer with the empty
            // log and keep none of its entries.
            None => debug!(
                session_id = %message.session_id,
                from = %sender.id,
                "log exchange for an unknown session"
            ),
        }

        let entries = self.manager.logs().read_by_session(&message.session_id)?;
        debug!(
            session_id = %message.session_id,
            received = request.logs.len(),
            sent = entries.len(),
            "log exchange"
        );
        let response = RecoverResponse {
            logs: self.sign_entries(entries)?,
        };
        let reply = SatpMessage::reply_to(message, message.hash()?, Payload::RecoverResponse(response));
        orchestrator.sign_response(reply)
    }

    /// Undo this side of a session at the counterparty's request. Refuses
    /// (with `success: false`) once this side is past the point of no
    /// return.
    pub async fn handle_rollback_request(&self, message: &SatpMessage) -> Result<SatpMessage, SatpError> {
        let orchestrator = self.manager.orchestrator();
        let sender = orchestrator.verify_inbound(message)?.clone();
        self.monitor.record_message("received", message.message_type);
        let Payload::RollbackRequest(request) = &message.payload else {
            return Err(SatpError::Validation(format!(
                "expected rollback-request, got {}",
                message.message_type
            )));
        };
        if let Some(data) = self.known_session(&message.session_id)? {
            self.check_counterparty(&data, &sender)?;
        }
        info!(
            session_id = %message.session_id,
            from = %sender.id,
            reason = %request.reason,
            "rollback requested"
        );

        let ack = self.rollback_locally(&message.session_id).await;
        let reply = SatpMessage::reply_to(message, message.hash()?, Payload::RollbackAck(ack));
        orchestrator.sign_response(reply)
    }

    async fn rollback_locally(&self, session_id: &str) -> RollbackAck {
        let refuse = |reason: String| RollbackAck {
            success: false,
            compensated: Vec::new(),
            reason,
        };

        let session = match self.manager.find_session(session_id) {
            Ok(session) => session,
            Err(SatpError::SessionNotFound(_)) => {
                return RollbackAck {
                    success: true,
                    compensated: Vec::new(),
                    reason: "no such session".into(),
                }
            }
            Err(e) => return refuse(e.to_string()),
        };
        let entries = match self.manager.logs().read_by_session(session_id) {
            Ok(entries) => entries,
            Err(e) => return refuse(e.to_string()),
        };
        let local = LogFootprint::from_entries(&entries);
        let primary = session.lock().primary().map(|d| d.clone());
        let data = match primary {
            Ok(data) => data,
            Err(e) => return refuse(e.to_string()),
        };
        let role = if data.role == Role::Server { Role::Server } else { Role::Client };

        if local.rolled_back {
            return RollbackAck {
                success: true,
                compensated: Vec::new(),
                reason: "already rolled back".into(),
            };
        }
        if local.completed {
            return refuse("transfer already completed".into());
        }
        let past_no_return = match role {
            Role::Server => local.assign_started,
            Role::Client | Role::Both => local.burn_started,
        };
        if past_no_return {
            return refuse("past the point of no return".into());
        }

        session.lock().set_state(SessionState::Recovering);
        let outcome = match self.undo_local(&session, &data, role, &local).await {
            Ok(compensated) => self.finish_rollback(&session, role).map(|_| compensated),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(compensated) => RollbackAck {
                success: true,
                compensated,
                reason: String::new(),
            },
            Err(e) => {
                // Left to our own scanner.
                self.tracked.lock().insert(session_id.to_string());
                refuse(e.to_string())
            }
        }
    }
}

impl std::fmt::Debug for CrashManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashManager")
            .field("scan_interval", &self.scan_interval)
            .field("tracked", &self.tracked.lock().len())
            .finish()
    }
}
