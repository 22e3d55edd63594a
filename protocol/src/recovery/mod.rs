//! # Crash Recovery
//!
//! Repairs sessions that a crash, a partition or an exhausted retry budget
//! left half done. The rules, in order:
//!
//! - a session closed by `transfer-complete/done` or `rollback/done` is
//!   never touched again;
//! - past the point of no return (the client burn, or a server assign) the
//!   transfer is rolled **forward**;
//! - otherwise every ledger effect is compensated in reverse, counterparty
//!   first: `unlock` for `lock`, `burn` for `mint`;
//! - a session with nothing to undo is simply closed.
//!
//! Before deciding, both gateways swap their logs for the session as
//! signed [`RemoteLog`](crate::log::RemoteLog) proofs, so each keeps
//! evidence of what the other claims to have done.

pub mod crash_manager;
pub mod plan;

pub use crash_manager::{CrashManager, RecoveryReport, Resolution};
pub use plan::{plan_client, plan_server, LogFootprint, RecoveryPlan};
