//! # Cross-Chain Layer
//!
//! Everything the gateway knows about ledgers goes through the
//! [`LedgerLeaf`] trait. Leafs are registered per ledger id in a
//! [`LeafRegistry`] when the gateway is configured; the
//! [`CrossChainManager`] picks the leaf for an asset's network, bounds each
//! call with a timeout and publishes receipts.

pub mod leaf;
pub mod manager;
pub mod memory;
pub mod registry;

pub use leaf::{LedgerError, LedgerLeaf, LedgerOperation, Receipt};
pub use manager::{CrossChainManager, LedgerEffect};
pub use memory::InMemoryLedger;
pub use registry::LeafRegistry;
