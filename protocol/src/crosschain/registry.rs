//! Ledger leafs keyed by ledger (network) id, fixed at configuration time.

use std::collections::HashMap;
use std::sync::Arc;

use super::leaf::{LedgerError, LedgerLeaf};

#[derive(Clone, Default)]
pub struct LeafRegistry {
    leaves: HashMap<String, Arc<dyn LedgerLeaf>>,
}

impl LeafRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `leaf` under its own ledger id. A second leaf for the same
    /// id replaces the first.
    pub fn register(&mut self, leaf: Arc<dyn LedgerLeaf>) {
        self.leaves.insert(leaf.ledger_id().to_string(), leaf);
    }

    pub fn with(mut self, leaf: Arc<dyn LedgerLeaf>) -> Self {
        self.register(leaf);
        self
    }

    pub fn get(&self, ledger_id: &str) -> Result<Arc<dyn LedgerLeaf>, LedgerError> {
        self.leaves
            .get(ledger_id)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownLedger(ledger_id.to_string()))
    }

    pub fn contains(&self, ledger_id: &str) -> bool {
        self.leaves.contains_key(ledger_id)
    }

    pub fn ledger_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.leaves.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

impl std::fmt::Debug for LeafRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafRegistry")
            .field("ledgers", &self.ledger_ids())
            .finish()
    }
}
