//! # SATP Manager
//!
//! Owns the active-session map and the plumbing every protocol step shares:
//! write-ahead logging, hash recording, ledger effects and session
//! teardown. The client-side stage driver lives in `client.rs`, the
//! server-side handlers in `server.rs`.
//!
//! ## Write order
//!
//! A step's outcome is never visible in live session data before it is in
//! the log. [`SatpManager::commit`] applies a mutation to a *copy* of the
//! session data, appends that snapshot as a `done` entry, and only then
//! applies the same mutation to the live data.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::request::SessionStatus;
use super::retry::{with_retries, RetryBudget};
use super::SatpError;
use crate::config::SessionPolicy;
use crate::crosschain::{CrossChainManager, LedgerEffect, Receipt};
use crate::log::{ledger_log_type, LocalLog, LogOperation, LogRepository, LOG_TYPE_TRANSFER};
use crate::messages::SatpMessage;
use crate::monitor::GatewayMonitor;
use crate::orchestrator::GatewayOrchestrator;
use crate::session::{Role, Session, SessionData, SessionRecord, SessionState, SharedSession};

pub struct SatpManager {
    orchestrator: Arc<GatewayOrchestrator>,
    ledgers: Arc<CrossChainManager>,
    logs: Arc<dyn LogRepository>,
    monitor: Arc<GatewayMonitor>,
    policy: SessionPolicy,
    completed_ttl: Duration,
    sessions: RwLock<HashMap<String, SharedSession>>,
}

impl SatpManager {
    pub fn new(
        orchestrator: Arc<GatewayOrchestrator>,
        ledgers: Arc<CrossChainManager>,
        logs: Arc<dyn LogRepository>,
        monitor: Arc<GatewayMonitor>,
        policy: SessionPolicy,
        completed_ttl: Duration,
    ) -> Self {
        Self {
            orchestrator,
            ledgers,
            logs,
            monitor,
            policy,
            completed_ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<GatewayOrchestrator> {
        &self.orchestrator
    }

    pub fn ledgers(&self) -> &Arc<CrossChainManager> {
        &self.ledgers
    }

    pub fn logs(&self) -> &Arc<dyn LogRepository> {
        &self.logs
    }

    pub fn monitor(&self) -> &Arc<GatewayMonitor> {
        &self.monitor
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    // -----------------------------------------------------------------------
    // Active sessions
    // -----------------------------------------------------------------------

    pub fn get_session(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Insert `session` unless one with the same id is already active, and
    /// return whichever ends up in the map.
    pub fn insert_session(&self, session: Session) -> SharedSession {
        let mut sessions = self.sessions.write();
        let shared = sessions
            .entry(session.id().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(session)))
            .clone();
        self.monitor.active_sessions.set(sessions.len() as i64);
        shared
    }

    pub fn remove_session(&self, session_id: &str) -> Option<SharedSession> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(session_id);
        self.monitor.active_sessions.set(sessions.len() as i64);
        removed
    }

    pub fn active_session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Active sessions opened under `context_id`.
    pub fn sessions_by_context(&self, context_id: &str) -> Vec<SessionStatus> {
        let sessions: Vec<SharedSession> = self.sessions.read().values().cloned().collect();
        sessions
            .iter()
            .filter_map(|s| {
                let guard = s.lock();
                if guard.context_id() != context_id {
                    return None;
                }
                guard.primary().ok().map(SessionStatus::from)
            })
            .collect()
    }

    /// Drop sessions that completed or rolled back longer ago than the
    /// completed-session TTL.
    pub fn prune_completed(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        let ttl = self.completed_ttl;
        sessions.retain(|_, s| !s.lock().closed_for(ttl));
        self.monitor.active_sessions.set(sessions.len() as i64);
        let pruned = before - sessions.len();
        if pruned > 0 {
            debug!(pruned, "pruned closed sessions");
        }
        pruned
    }

    /// Rebuild a session from the log and make it active.
    pub fn restore_session(&self, session_id: &str) -> Result<Option<SharedSession>, SatpError> {
        let entries = self.logs.read_by_session(session_id)?;
        match Session::from_log(&entries)? {
            Some(session) => {
                info!(session_id, entries = entries.len(), "session restored from log");
                Ok(Some(self.insert_session(session)))
            }
            None => Ok(None),
        }
    }

    /// Active session, or one rebuilt from the log.
    pub fn find_session(&self, session_id: &str) -> Result<SharedSession, SatpError> {
        if let Some(session) = self.get_session(session_id) {
            return Ok(session);
        }
        self.restore_session(session_id)?
            .ok_or_else(|| SatpError::SessionNotFound(session_id.to_string()))
    }

    /// Status of a session, active or only present in the log.
    pub fn session_status(&self, session_id: &str) -> Result<SessionStatus, SatpError> {
        if let Some(session) = self.get_session(session_id) {
            let guard = session.lock();
            return Ok(SessionStatus::from(guard.primary()?));
        }
        let entries = self.logs.read_by_session(session_id)?;
        let session = Session::from_log(&entries)?
            .ok_or_else(|| SatpError::SessionNotFound(session_id.to_string()))?;
        Ok(SessionStatus::from(session.primary()?))
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    /// Append an entry carrying `data` (and optionally a message) as its
    /// snapshot. `Ok(false)` if the entry already existed.
    pub(crate) fn log_step(
        &self,
        data: &SessionData,
        log_type: &str,
        operation: LogOperation,
        message: Option<&SatpMessage>,
    ) -> Result<bool, SatpError> {
        let record = SessionRecord {
            session: data.clone(),
            message: message.cloned(),
        };
        let entry = LocalLog::new(
            data.id.clone(),
            log_type,
            operation,
            record.to_json()?,
            data.last_sequence_number,
        );
        let written = self.logs.append(&entry)?;
        debug!(
            session_id = %data.id,
            key = %entry.key,
            written,
            "log append"
        );
        Ok(written)
    }

    /// Log the current state of one side of `session`.
    pub(crate) fn log_current(
        &self,
        session: &SharedSession,
        role: Role,
        log_type: &str,
        operation: LogOperation,
    ) -> Result<bool, SatpError> {
        let snapshot = session.lock().data(role)?.clone();
        self.log_step(&snapshot, log_type, operation, None)
    }

    /// Apply `mutate` to a copy, log the copy as `{log_type}/done`, then
    /// apply `mutate` to the live data. A live `Recovering` state survives
    /// the mutation.
    pub(crate) fn commit<F>(
        &self,
        session: &SharedSession,
        role: Role,
        log_type: &str,
        message: Option<&SatpMessage>,
        mutate: F,
    ) -> Result<SessionData, SatpError>
    where
        F: Fn(&mut SessionData) -> Result<(), SatpError>,
    {
        let mut snapshot = session.lock().data(role)?.clone();
        mutate(&mut snapshot)?;
        self.log_step(&snapshot, log_type, LogOperation::Done, message)?;

        let mut guard = session.lock();
        let live = guard.data_mut(role)?;
        let recovering = live.state == SessionState::Recovering;
        mutate(live)?;
        if recovering {
            live.state = SessionState::Recovering;
        }
        Ok(snapshot)
    }

    // -----------------------------------------------------------------------
    // Ledger effects
    // -----------------------------------------------------------------------

    /// Run a ledger effect between `ledger-{op}/init` and `ledger-{op}/done`
    /// entries. With a budget the call is retried; without one it gets a
    /// single attempt (the server side, where the client drives retries).
    pub(crate) async fn ledger_step(
        &self,
        session: &SharedSession,
        role: Role,
        network_id: &str,
        effect: LedgerEffect,
        budget: Option<&RetryBudget>,
    ) -> Result<Receipt, SatpError> {
        let operation = effect.operation();
        let log_type = ledger_log_type(operation);
        self.log_current(session, role, &log_type, LogOperation::Init)?;

        let receipt = match budget {
            Some(budget) => {
                let effect = &effect;
                with_retries(session, role, budget, &self.monitor, &log_type, move |timeout| async move {
                    Ok(self.ledgers.apply(network_id, effect, timeout).await?)
                })
                .await?
            }
            None => {
                self.ledgers
                    .apply(network_id, &effect, self.policy.attempt_timeout())
                    .await?
            }
        };

        let op_name = operation.to_string();
        let tx_id = receipt.tx_id.clone();
        self.commit(session, role, &log_type, None, |data| {
            data.receipts.insert(op_name.clone(), tx_id.clone());
            Ok(())
        })?;
        Ok(receipt)
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Mark a session failed, write its `transfer/fail` entry and drop it
    /// from the active map. The crash manager picks it up from the log.
    pub(crate) fn fail_session(&self, session: &SharedSession, role: Role, cause: &SatpError) {
        let snapshot = {
            let mut guard = session.lock();
            guard.set_state(SessionState::Failed);
            guard.data(role).map(|d| d.clone())
        };
        let Ok(snapshot) = snapshot else {
            return;
        };
        if let Err(e) = self.log_step(&snapshot, LOG_TYPE_TRANSFER, LogOperation::Fail, None) {
            error!(session_id = %snapshot.id, "failed to log session failure: {}", e);
        }
        self.remove_session(&snapshot.id);
        self.monitor.sessions_failed.inc();
        error!(
            session_id = %snapshot.id,
            retries = snapshot.retry_count,
            kind = cause.kind(),
            "transfer failed: {}",
            cause
        );
    }
}
