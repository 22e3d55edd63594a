//! # SATP Engine
//!
//! The stage machine of a transfer. The client side drives the exchange
//! (see [`SatpManager::transact`]); the server side answers one message at
//! a time (see [`SatpManager::handle_message`]).
//!
//! ```text
//!  client gateway                                  server gateway
//!  ──────────────                                  ──────────────
//!  Stage 0  NewSession ───────────────────────────▶ open session
//!           PreTransfer ──────────────────────────▶ wrap receiver asset
//!           wrap sender asset
//!  Stage 1  TransferProposal ─────────────────────▶ check claims
//!           TransferCommence ─────────────────────▶
//!  Stage 2  lock ─▶ LockAssertion ────────────────▶ check lock
//!  Stage 3  CommitPreparation ────────────────────▶ mint
//!           burn ─▶ CommitFinalAssertion ─────────▶ assign to beneficiary
//!           TransferComplete ─────────────────────▶ complete
//! ```

mod client;
pub mod error;
pub mod manager;
pub mod request;
pub mod retry;
mod server;

pub use error::SatpError;
pub use manager::SatpManager;
pub use request::{ApproveAddressResponse, SessionStatus, TransactRequest, TransactResponse};
pub use retry::RetryBudget;
