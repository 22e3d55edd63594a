//! Deciding what to do with an interrupted session from its log.
//!
//! Only the log counts here: live session data may be ahead of what was
//! made durable, so recovery reads which steps reached `init` and which
//! reached `done`, for this gateway and (when the exchange succeeded) for
//! the counterparty.

use crate::crosschain::LedgerOperation;
use crate::log::{
    ledger_log_type, rollback_log_type, LocalLog, LogOperation, LOG_TYPE_ROLLBACK,
    LOG_TYPE_TRANSFER, LOG_TYPE_TRANSFER_COMPLETE,
};
use crate::messages::MessageType;

/// What a session's log says happened, reduced to the facts recovery
/// needs. An `init` without its `done` means the step may or may not have
/// taken effect; ledger calls are idempotent, so repeating or compensating
/// it is safe.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogFootprint {
    pub wrapped: bool,
    pub lock_started: bool,
    pub unlocked: bool,
    pub commit_requested: bool,
    pub burn_started: bool,
    pub burned: bool,
    pub mint_started: bool,
    pub mint_compensated: bool,
    pub assign_started: bool,
    pub assigned: bool,
    pub completed: bool,
    pub rolled_back: bool,
    pub failed: bool,
    pub last_timestamp_ms: u64,
}

impl LogFootprint {
    pub fn from_entries(entries: &[LocalLog]) -> Self {
        let has = |log_type: &str, op: LogOperation| entries.iter().any(|e| e.is(log_type, op));
        let ledger = |op: LedgerOperation, step: LogOperation| has(&ledger_log_type(op), step);

        Self {
            wrapped: ledger(LedgerOperation::Wrap, LogOperation::Done),
            lock_started: ledger(LedgerOperation::Lock, LogOperation::Init),
            unlocked: has(&rollback_log_type(LedgerOperation::Unlock), LogOperation::Done),
            commit_requested: has(MessageType::CommitPreparationRequest.log_type(), LogOperation::Init),
            burn_started: ledger(LedgerOperation::Burn, LogOperation::Init),
            burned: ledger(LedgerOperation::Burn, LogOperation::Done),
            mint_started: ledger(LedgerOperation::Mint, LogOperation::Init),
            mint_compensated: has(&rollback_log_type(LedgerOperation::Burn), LogOperation::Done),
            assign_started: ledger(LedgerOperation::Assign, LogOperation::Init),
            assigned: ledger(LedgerOperation::Assign, LogOperation::Done),
            completed: has(LOG_TYPE_TRANSFER_COMPLETE, LogOperation::Done),
            rolled_back: has(LOG_TYPE_ROLLBACK, LogOperation::Done),
            failed: has(LOG_TYPE_TRANSFER, LogOperation::Fail),
            last_timestamp_ms: entries.iter().map(|e| e.timestamp_ms).max().unwrap_or(0),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.completed || self.rolled_back
    }

    /// Escrow or mint that still needs undoing on this side.
    pub fn has_open_effect(&self) -> bool {
        (self.lock_started && !self.unlocked) || (self.mint_started && !self.mint_compensated)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// Past the point of no return: finish the transfer.
    RollForward,
    /// Undo ledger effects, counterparty first.
    Compensate,
    /// Nothing to undo; close the session.
    Drop,
    /// Not enough information yet (the counterparty's log is needed).
    Undecided,
}

/// Plan for the client side. The client's own burn is the point of no
/// return; a server that has started assigning proves the burn too.
pub fn plan_client(local: &LogFootprint, remote: Option<&LogFootprint>) -> RecoveryPlan {
    if local.burn_started || remote.is_some_and(|r| r.assign_started) {
        RecoveryPlan::RollForward
    } else if local.lock_started && !local.unlocked {
        RecoveryPlan::Compensate
    } else {
        RecoveryPlan::Drop
    }
}

/// Plan for the server side. Once assignment started the transfer is
/// finished. A mint is only undone when the client's log shows no burn.
pub fn plan_server(local: &LogFootprint, remote: Option<&LogFootprint>) -> RecoveryPlan {
    if local.assign_started {
        return RecoveryPlan::RollForward;
    }
    if !local.mint_started || local.mint_compensated {
        return RecoveryPlan::Drop;
    }
    match remote {
        Some(client) if client.burn_started => RecoveryPlan::RollForward,
        Some(_) => RecoveryPlan::Compensate,
        None => RecoveryPlan::Undecided,
    }
}
