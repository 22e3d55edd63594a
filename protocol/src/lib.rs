// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # SATP Gateway Core Library
//!
//! A gateway moves an asset from a ledger it fronts to a ledger fronted by a
//! counterparty gateway, following the Secure Asset Transfer Protocol
//! (SATP). Two gateways negotiate the transfer in four stages of signed,
//! hash-chained messages; every step is written to a durable log before it
//! takes effect, so a crash on either side can be repaired from the logs.
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! - **crypto**: Ed25519 signatures and SHA-256 digests over canonical JSON.
//! - **identity** / **asset**: who the gateways are and what they move.
//! - **messages**: the signed envelope and the payload of every stage.
//! - **session**: per-transfer state, hashes and sequence numbers.
//! - **log**: the write-ahead protocol log, sled-backed.
//! - **crosschain**: the ledger leaf trait, its registry and an in-memory leaf.
//! - **orchestrator**: known gateways, signing, and the transport seam.
//! - **satp**: the stage driver (client) and stage handlers (server).
//! - **recovery**: the crash manager, which rolls forward or compensates.
//! - **gateway**: composition root and inbound dispatch.
//! - **monitor**: the prometheus registry every component reports into.
//! - **config**: protocol constants and the node configuration file.
//!
//! ## Ground Rules
//!
//! 1. Nothing is visible in session data before it is in the log.
//! 2. Every ledger effect is idempotent, and every one has a compensation.
//! 3. A session is only ever driven by one party at a time.

pub mod asset;
pub mod config;
pub mod crosschain;
pub mod crypto;
pub mod gateway;
pub mod identity;
pub mod log;
pub mod messages;
pub mod monitor;
pub mod orchestrator;
pub mod recovery;
pub mod satp;
pub mod session;

pub use gateway::{Gateway, GatewayError};
pub use satp::{SatpError, SatpManager, TransactRequest, TransactResponse};

/// Milliseconds since the Unix epoch, the timestamp unit used in logs and
/// session data.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
