//! # In-Memory Ledger
//!
//! A fungible-token ledger held entirely in memory. It backs the devnet
//! nodes, the integration tests and the two-gateway demo.
//!
//! Accounting model:
//!
//! - balances per `(token_type, owner)`, with the bridge escrow as an
//!   ordinary account;
//! - allowances per `(owner, token_type)` towards the bridge, consumed by
//!   `lock` and restored by `unlock`;
//! - per wrapped asset, the receipt of each operation already applied. That
//!   record is what makes every call idempotent.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::leaf::{LedgerError, LedgerLeaf, LedgerOperation, Receipt};
use crate::asset::Asset;
use crate::config::LedgerConfig;
use crate::identity::LedgerType;

struct WrappedAsset {
    asset: Asset,
    applied: HashMap<LedgerOperation, Receipt>,
}

impl WrappedAsset {
    fn has(&self, op: LedgerOperation) -> bool {
        self.applied.contains_key(&op)
    }

    /// Stored receipt for `op`, marked as a replay.
    fn replay(&self, op: LedgerOperation) -> Option<Receipt> {
        self.applied.get(&op).map(|r| Receipt {
            no_op: true,
            ..r.clone()
        })
    }
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<(String, String), u64>,
    allowances: HashMap<(String, String), u64>,
    assets: HashMap<String, WrappedAsset>,
    next_tx: u64,
}

impl LedgerState {
    fn balance(&self, token_type: &str, owner: &str) -> u64 {
        self.balances
            .get(&(token_type.to_string(), owner.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn balance_mut(&mut self, token_type: &str, owner: &str) -> &mut u64 {
        self.balances
            .entry((token_type.to_string(), owner.to_string()))
            .or_insert(0)
    }

    fn allowance_mut(&mut self, owner: &str, token_type: &str) -> &mut u64 {
        self.allowances
            .entry((owner.to_string(), token_type.to_string()))
            .or_insert(0)
    }

    fn transfer(&mut self, token_type: &str, from: &str, to: &str, amount: u64) {
        *self.balance_mut(token_type, from) -= amount;
        *self.balance_mut(token_type, to) += amount;
    }
}

pub struct InMemoryLedger {
    ledger_id: String,
    ledger_type: LedgerType,
    bridge_account: String,
    state: Mutex<LedgerState>,
    available: AtomicBool,
}

impl InMemoryLedger {
    pub fn new(
        ledger_id: impl Into<String>,
        ledger_type: LedgerType,
        bridge_account: impl Into<String>,
    ) -> Self {
        Self {
            ledger_id: ledger_id.into(),
            ledger_type,
            bridge_account: bridge_account.into(),
            state: Mutex::new(LedgerState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Ledger described by `config`, with its genesis accounts credited.
    pub fn from_config(config: &LedgerConfig) -> Self {
        let ledger = Self::new(
            config.network.id.clone(),
            config.network.ledger_type,
            config.bridge_account.clone(),
        );
        for account in &config.genesis {
            ledger.credit(&account.owner, &account.token_type, account.balance);
            if account.allowance > 0 {
                ledger.approve(&account.owner, &account.token_type, account.allowance);
            }
        }
        ledger
    }

    // -- Account management --------------------------------------------------

    pub fn credit(&self, owner: &str, token_type: &str, amount: u64) {
        *self.state.lock().balance_mut(token_type, owner) += amount;
    }

    /// Set `owner`'s allowance towards the bridge.
    pub fn approve(&self, owner: &str, token_type: &str, amount: u64) {
        *self.state.lock().allowance_mut(owner, token_type) = amount;
    }

    pub fn balance_of(&self, owner: &str, token_type: &str) -> u64 {
        self.state.lock().balance(token_type, owner)
    }

    pub fn allowance_of(&self, owner: &str, token_type: &str) -> u64 {
        self.state
            .lock()
            .allowances
            .get(&(owner.to_string(), token_type.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn bridge_account(&self) -> &str {
        &self.bridge_account
    }

    pub fn bridge_balance(&self, token_type: &str) -> u64 {
        self.balance_of(&self.bridge_account, token_type)
    }

    /// Operations applied so far to `asset_id`.
    pub fn applied_operations(&self, asset_id: &str) -> Vec<LedgerOperation> {
        let state = self.state.lock();
        let mut ops: Vec<_> = state
            .assets
            .get(asset_id)
            .map(|a| a.applied.keys().copied().collect())
            .unwrap_or_default();
        ops.sort_by_key(|op| *op as u8);
        ops
    }

    /// Simulate an outage: while unavailable, every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    // -- Internals -----------------------------------------------------------

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::Unavailable(self.ledger_id.clone()))
        }
    }

    fn receipt(
        &self,
        state: &mut LedgerState,
        operation: LedgerOperation,
        asset_id: &str,
        amount: u64,
        no_op: bool,
    ) -> Receipt {
        state.next_tx += 1;
        Receipt {
            ledger_id: self.ledger_id.clone(),
            operation,
            asset_id: asset_id.to_string(),
            amount,
            tx_id: format!("{}:{:08}", self.ledger_id, state.next_tx),
            timestamp_ms: crate::now_ms(),
            no_op,
        }
    }

    fn invalid(operation: LedgerOperation, asset_id: &str, reason: impl Into<String>) -> LedgerError {
        LedgerError::InvalidOperation {
            operation,
            asset_id: asset_id.to_string(),
            reason: reason.into(),
        }
    }

    fn record(state: &mut LedgerState, asset_id: &str, receipt: &Receipt) {
        if let Some(wrapped) = state.assets.get_mut(asset_id) {
            wrapped.applied.insert(receipt.operation, receipt.clone());
        }
    }

    /// Checks shared by every forward operation on an already wrapped asset.
    /// Returns the asset, or a replay receipt if `op` was already applied.
    fn prepare(
        state: &LedgerState,
        op: LedgerOperation,
        asset_id: &str,
        amount: u64,
    ) -> Result<Result<Asset, Receipt>, LedgerError> {
        let wrapped = state
            .assets
            .get(asset_id)
            .ok_or_else(|| LedgerError::AssetNotWrapped(asset_id.to_string()))?;
        if let Some(replay) = wrapped.replay(op) {
            return Ok(Err(replay));
        }
        if amount != wrapped.asset.amount {
            return Err(Self::invalid(
                op,
                asset_id,
                format!("amount {} does not match wrapped amount {}", amount, wrapped.asset.amount),
            ));
        }
        Ok(Ok(wrapped.asset.clone()))
    }

    fn wrap(&self, asset: &Asset) -> Result<Receipt, LedgerError> {
        let mut state = self.state.lock();
        if let Some(replay) = state
            .assets
            .get(&asset.token_id)
            .and_then(|w| w.replay(LedgerOperation::Wrap))
        {
            return Ok(replay);
        }
        state.assets.insert(
            asset.token_id.clone(),
            WrappedAsset {
                asset: asset.clone(),
                applied: HashMap::new(),
            },
        );
        let receipt = self.receipt(&mut state, LedgerOperation::Wrap, &asset.token_id, asset.amount, false);
        Self::record(&mut state, &asset.token_id, &receipt);
        Ok(receipt)
    }

    fn lock(&self, asset_id: &str, amount: u64) -> Result<Receipt, LedgerError> {
        let op = LedgerOperation::Lock;
        let mut state = self.state.lock();
        let asset = match Self::prepare(&state, op, asset_id, amount)? {
            Ok(asset) => asset,
            Err(replay) => return Ok(replay),
        };

        let approved = *state.allowance_mut(&asset.owner, &asset.token_type);
        if approved < amount {
            return Err(LedgerError::InsufficientAllowance {
                owner: asset.owner,
                required: amount,
                approved,
            });
        }
        let available = state.balance(&asset.token_type, &asset.owner);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                owner: asset.owner,
                required: amount,
                available,
            });
        }

        *state.allowance_mut(&asset.owner, &asset.token_type) -= amount;
        state.transfer(&asset.token_type, &asset.owner, &self.bridge_account, amount);
        let receipt = self.receipt(&mut state, op, asset_id, amount, false);
        Self::record(&mut state, asset_id, &receipt);
        Ok(receipt)
    }

    fn unlock(&self, asset_id: &str, amount: u64) -> Result<Receipt, LedgerError> {
        let op = LedgerOperation::Unlock;
        let mut state = self.state.lock();
        let Some(wrapped) = state.assets.get(asset_id) else {
            return Ok(self.receipt(&mut state, op, asset_id, amount, true));
        };
        if let Some(replay) = wrapped.replay(op) {
            return Ok(replay);
        }
        if !wrapped.has(LedgerOperation::Lock) {
            return Ok(self.receipt(&mut state, op, asset_id, amount, true));
        }
        if wrapped.has(LedgerOperation::Burn) {
            return Err(Self::invalid(op, asset_id, "escrow already burned"));
        }
        let asset = wrapped.asset.clone();
        let locked = wrapped.applied[&LedgerOperation::Lock].amount;

        state.transfer(&asset.token_type, &self.bridge_account, &asset.owner, locked);
        *state.allowance_mut(&asset.owner, &asset.token_type) += locked;
        let receipt = self.receipt(&mut state, op, asset_id, locked, false);
        Self::record(&mut state, asset_id, &receipt);
        Ok(receipt)
    }

    fn mint(&self, asset_id: &str, amount: u64) -> Result<Receipt, LedgerError> {
        let op = LedgerOperation::Mint;
        let mut state = self.state.lock();
        let asset = match Self::prepare(&state, op, asset_id, amount)? {
            Ok(asset) => asset,
            Err(replay) => return Ok(replay),
        };
        *state.balance_mut(&asset.token_type, &self.bridge_account) += amount;
        let receipt = self.receipt(&mut state, op, asset_id, amount, false);
        Self::record(&mut state, asset_id, &receipt);
        Ok(receipt)
    }

    fn burn(&self, asset_id: &str, amount: u64) -> Result<Receipt, LedgerError> {
        let op = LedgerOperation::Burn;
        let mut state = self.state.lock();
        let Some(wrapped) = state.assets.get(asset_id) else {
            return Ok(self.receipt(&mut state, op, asset_id, amount, true));
        };
        if let Some(replay) = wrapped.replay(op) {
            return Ok(replay);
        }
        let escrowed = wrapped.has(LedgerOperation::Lock) && !wrapped.has(LedgerOperation::Unlock);
        let minted = wrapped.has(LedgerOperation::Mint);
        if !escrowed && !minted {
            return Ok(self.receipt(&mut state, op, asset_id, amount, true));
        }
        if minted && wrapped.has(LedgerOperation::Assign) {
            return Err(Self::invalid(op, asset_id, "minted funds already assigned"));
        }
        let token_type = wrapped.asset.token_type.clone();
        let held = state.balance(&token_type, &self.bridge_account);
        if held < amount {
            return Err(LedgerError::InsufficientBalance {
                owner: self.bridge_account.clone(),
                required: amount,
                available: held,
            });
        }
        *state.balance_mut(&token_type, &self.bridge_account) -= amount;
        let receipt = self.receipt(&mut state, op, asset_id, amount, false);
        Self::record(&mut state, asset_id, &receipt);
        Ok(receipt)
    }

    fn assign(&self, asset_id: &str, owner: &str, amount: u64) -> Result<Receipt, LedgerError> {
        let op = LedgerOperation::Assign;
        let mut state = self.state.lock();
        let asset = match Self::prepare(&state, op, asset_id, amount)? {
            Ok(asset) => asset,
            Err(replay) => return Ok(replay),
        };
        let wrapped = &state.assets[asset_id];
        if !wrapped.has(LedgerOperation::Mint) {
            return Err(Self::invalid(op, asset_id, "nothing minted to assign"));
        }
        if wrapped.has(LedgerOperation::Burn) {
            return Err(Self::invalid(op, asset_id, "minted funds were burned"));
        }
        state.transfer(&asset.token_type, &self.bridge_account, owner, amount);
        let receipt = self.receipt(&mut state, op, asset_id, amount, false);
        Self::record(&mut state, asset_id, &receipt);
        Ok(receipt)
    }
}

#[async_trait]
impl LedgerLeaf for InMemoryLedger {
    fn ledger_id(&self) -> &str {
        &self.ledger_id
    }

    fn ledger_type(&self) -> LedgerType {
        self.ledger_type
    }

    async fn approve_address(&self, _token_type: &str) -> Result<String, LedgerError> {
        self.check_available()?;
        Ok(self.bridge_account.clone())
    }

    async fn wrap_asset(&self, asset: &Asset) -> Result<Receipt, LedgerError> {
        self.check_available()?;
        self.wrap(asset)
    }

    async fn lock_asset(&self, asset_id: &str, amount: u64) -> Result<Receipt, LedgerError> {
        self.check_available()?;
        self.lock(asset_id, amount)
    }

    async fn unlock_asset(&self, asset_id: &str, amount: u64) -> Result<Receipt, LedgerError> {
        self.check_available()?;
        self.unlock(asset_id, amount)
    }

    async fn mint_asset(&self, asset_id: &str, amount: u64) -> Result<Receipt, LedgerError> {
        self.check_available()?;
        self.mint(asset_id, amount)
    }

    async fn burn_asset(&self, asset_id: &str, amount: u64) -> Result<Receipt, LedgerError> {
        self.check_available()?;
        self.burn(asset_id, amount)
    }

    async fn assign_asset(
        &self,
        asset_id: &str,
        owner: &str,
        amount: u64,
    ) -> Result<Receipt, LedgerError> {
        self.check_available()?;
        self.assign(asset_id, owner, amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "SATPToken";

    fn ledger() -> InMemoryLedger {
        let ledger = InMemoryLedger::new("besu", LedgerType::Besu, "bridge");
        ledger.credit("alice", TOKEN, 1_000);
        ledger.approve("alice", TOKEN, 100);
        ledger
    }

    fn asset(amount: u64) -> Asset {
        Asset::fungible("a-1", TOKEN, amount, "alice", "besu")
    }

    #[tokio::test]
    async fn lock_then_burn_moves_funds_out_of_circulation() {
        let l = ledger();
        l.wrap_asset(&asset(100)).await.unwrap();
        l.lock_asset("a-1", 100).await.unwrap();
        assert_eq!(l.balance_of("alice", TOKEN), 900);
        assert_eq!(l.bridge_balance(TOKEN), 100);
        assert_eq!(l.allowance_of("alice", TOKEN), 0);

        l.burn_asset("a-1", 100).await.unwrap();
        assert_eq!(l.bridge_balance(TOKEN), 0);
        assert!(l.unlock_asset("a-1", 100).await.is_err());
    }

    #[tokio::test]
    async fn operations_are_idempotent() {
        let l = ledger();
        l.wrap_asset(&asset(100)).await.unwrap();
        let first = l.lock_asset("a-1", 100).await.unwrap();
        let again = l.lock_asset("a-1", 100).await.unwrap();
        assert!(!first.no_op);
        assert!(again.no_op);
        assert_eq!(again.tx_id, first.tx_id);
        assert_eq!(l.balance_of("alice", TOKEN), 900);

        l.unlock_asset("a-1", 100).await.unwrap();
        let replay = l.unlock_asset("a-1", 100).await.unwrap();
        assert!(replay.no_op);
        assert_eq!(l.balance_of("alice", TOKEN), 1_000);
        assert_eq!(l.allowance_of("alice", TOKEN), 100);
        assert_eq!(l.bridge_balance(TOKEN), 0);
    }

    #[tokio::test]
    async fn compensation_without_forward_op_is_noop() {
        let l = ledger();
        l.wrap_asset(&asset(100)).await.unwrap();
        assert!(l.unlock_asset("a-1", 100).await.unwrap().no_op);
        assert!(l.burn_asset("a-1", 100).await.unwrap().no_op);
        assert!(l.unlock_asset("never-wrapped", 5).await.unwrap().no_op);
        assert_eq!(l.balance_of("alice", TOKEN), 1_000);
    }

    #[tokio::test]
    async fn lock_beyond_allowance_changes_nothing() {
        let l = ledger();
        l.wrap_asset(&asset(500)).await.unwrap();
        let err = l.lock_asset("a-1", 500).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientAllowance { required: 500, approved: 100, .. }
        ));
        assert_eq!(l.balance_of("alice", TOKEN), 1_000);
        assert_eq!(l.allowance_of("alice", TOKEN), 100);
        assert_eq!(l.bridge_balance(TOKEN), 0);
    }

    #[tokio::test]
    async fn mint_assign_and_mint_compensation() {
        let l = InMemoryLedger::new("fabric", LedgerType::Fabric, "bridge");
        let minted = Asset::fungible("b-1", TOKEN, 100, "bob", "fabric");
        l.wrap_asset(&minted).await.unwrap();
        assert!(l.assign_asset("b-1", "bob", 100).await.is_err());

        l.mint_asset("b-1", 100).await.unwrap();
        assert_eq!(l.bridge_balance(TOKEN), 100);
        l.assign_asset("b-1", "bob", 100).await.unwrap();
        assert_eq!(l.balance_of("bob", TOKEN), 100);
        assert_eq!(l.bridge_balance(TOKEN), 0);
        assert!(l.burn_asset("b-1", 100).await.is_err());

        let other = Asset::fungible("b-2", TOKEN, 40, "bob", "fabric");
        l.wrap_asset(&other).await.unwrap();
        l.mint_asset("b-2", 40).await.unwrap();
        l.burn_asset("b-2", 40).await.unwrap();
        assert_eq!(l.bridge_balance(TOKEN), 0);
        assert_eq!(
            l.applied_operations("b-2"),
            vec![LedgerOperation::Wrap, LedgerOperation::Mint, LedgerOperation::Burn]
        );
    }

    #[tokio::test]
    async fn unavailable_ledger_rejects_calls() {
        let l = ledger();
        l.set_available(false);
        assert!(matches!(
            l.wrap_asset(&asset(100)).await,
            Err(LedgerError::Unavailable(_))
        ));
        l.set_available(true);
        assert!(l.wrap_asset(&asset(100)).await.is_ok());
    }
}
