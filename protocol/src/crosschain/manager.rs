//! Routes ledger effects to the right leaf and publishes their receipts.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::leaf::{LedgerError, LedgerLeaf, LedgerOperation, Receipt};
use super::registry::LeafRegistry;
use crate::asset::Asset;

/// One ledger call, described as data so it can be retried and logged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEffect {
    Wrap(Asset),
    Lock { asset_id: String, amount: u64 },
    Unlock { asset_id: String, amount: u64 },
    Mint { asset_id: String, amount: u64 },
    Burn { asset_id: String, amount: u64 },
    Assign { asset_id: String, owner: String, amount: u64 },
}

impl LedgerEffect {
    pub fn operation(&self) -> LedgerOperation {
        match self {
            LedgerEffect::Wrap(_) => LedgerOperation::Wrap,
            LedgerEffect::Lock { .. } => LedgerOperation::Lock,
            LedgerEffect::Unlock { .. } => LedgerOperation::Unlock,
            LedgerEffect::Mint { .. } => LedgerOperation::Mint,
            LedgerEffect::Burn { .. } => LedgerOperation::Burn,
            LedgerEffect::Assign { .. } => LedgerOperation::Assign,
        }
    }

    pub fn asset_id(&self) -> &str {
        match self {
            LedgerEffect::Wrap(asset) => &asset.token_id,
            LedgerEffect::Lock { asset_id, .. }
            | LedgerEffect::Unlock { asset_id, .. }
            | LedgerEffect::Mint { asset_id, .. }
            | LedgerEffect::Burn { asset_id, .. }
            | LedgerEffect::Assign { asset_id, .. } => asset_id,
        }
    }

    async fn run(&self, leaf: &dyn LedgerLeaf) -> Result<Receipt, LedgerError> {
        match self {
            LedgerEffect::Wrap(asset) => leaf.wrap_asset(asset).await,
            LedgerEffect::Lock { asset_id, amount } => leaf.lock_asset(asset_id, *amount).await,
            LedgerEffect::Unlock { asset_id, amount } => leaf.unlock_asset(asset_id, *amount).await,
            LedgerEffect::Mint { asset_id, amount } => leaf.mint_asset(asset_id, *amount).await,
            LedgerEffect::Burn { asset_id, amount } => leaf.burn_asset(asset_id, *amount).await,
            LedgerEffect::Assign {
                asset_id,
                owner,
                amount,
            } => leaf.assign_asset(asset_id, owner, *amount).await,
        }
    }
}

/// Front door to every ledger this gateway fronts.
///
/// Receipts of successful calls are pushed into an optional bounded channel.
/// A full channel drops the receipt with a warning rather than stalling the
/// protocol.
pub struct CrossChainManager {
    registry: LeafRegistry,
    receipts: Option<mpsc::Sender<Receipt>>,
}

impl CrossChainManager {
    pub fn new(registry: LeafRegistry) -> Self {
        Self {
            registry,
            receipts: None,
        }
    }

    /// Attach a bounded receipt feed of `capacity` and return its receiver.
    pub fn with_receipt_channel(mut self, capacity: usize) -> (Self, mpsc::Receiver<Receipt>) {
        let (tx, rx) = mpsc::channel(capacity);
        self.receipts = Some(tx);
        (self, rx)
    }

    pub fn registry(&self) -> &LeafRegistry {
        &self.registry
    }

    pub fn serves(&self, network_id: &str) -> bool {
        self.registry.contains(network_id)
    }

    pub async fn approve_address(
        &self,
        network_id: &str,
        token_type: &str,
    ) -> Result<String, LedgerError> {
        self.registry.get(network_id)?.approve_address(token_type).await
    }

    /// Run `effect` on the leaf for `network_id`, bounded by `timeout`.
    pub async fn apply(
        &self,
        network_id: &str,
        effect: &LedgerEffect,
        timeout: Duration,
    ) -> Result<Receipt, LedgerError> {
        let leaf = self.registry.get(network_id)?;
        let receipt = tokio::time::timeout(timeout, effect.run(leaf.as_ref()))
            .await
            .map_err(|_| LedgerError::Timeout(timeout.as_millis() as u64))??;

        debug!(
            ledger = %network_id,
            operation = %receipt.operation,
            asset_id = %receipt.asset_id,
            tx_id = %receipt.tx_id,
            no_op = receipt.no_op,
            "ledger effect applied"
        );

        if let Some(feed) = &self.receipts {
            if let Err(e) = feed.try_send(receipt.clone()) {
                warn!(ledger = %network_id, "dropping ledger receipt: {}", e);
            }
        }
        Ok(receipt)
    }
}
