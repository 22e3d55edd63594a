//! The ledger leaf contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::asset::Asset;
use crate::identity::LedgerType;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("no ledger leaf registered for network {0}")]
    UnknownLedger(String),

    #[error("asset {0} has not been wrapped on this ledger")]
    AssetNotWrapped(String),

    #[error("insufficient balance for {owner}: required {required}, available {available}")]
    InsufficientBalance {
        owner: String,
        required: u64,
        available: u64,
    },

    #[error("insufficient allowance from {owner} to the bridge: required {required}, approved {approved}")]
    InsufficientAllowance {
        owner: String,
        required: u64,
        approved: u64,
    },

    #[error("invalid {operation} on asset {asset_id}: {reason}")]
    InvalidOperation {
        operation: LedgerOperation,
        asset_id: String,
        reason: String,
    },

    #[error("ledger call timed out after {0}ms")]
    Timeout(u64),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Operations & Receipts
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerOperation {
    Wrap,
    Lock,
    Unlock,
    Mint,
    Burn,
    Assign,
}

impl fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LedgerOperation::Wrap => "wrap",
            LedgerOperation::Lock => "lock",
            LedgerOperation::Unlock => "unlock",
            LedgerOperation::Mint => "mint",
            LedgerOperation::Burn => "burn",
            LedgerOperation::Assign => "assign",
        };
        f.write_str(s)
    }
}

/// Outcome of one ledger call. `no_op` is set when the call was an
/// idempotent replay or a compensation with nothing to undo.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub ledger_id: String,
    pub operation: LedgerOperation,
    pub asset_id: String,
    pub amount: u64,
    pub tx_id: String,
    pub timestamp_ms: u64,
    pub no_op: bool,
}

// ---------------------------------------------------------------------------
// LedgerLeaf
// ---------------------------------------------------------------------------

/// Narrow interface to one ledger. Implementations translate the six
/// capability calls into ledger transactions.
///
/// Every call must be idempotent per `asset_id`: repeating a call that
/// already took effect returns a receipt with `no_op = true` and changes
/// nothing. Compensations (`unlock`, `burn`) for a forward operation that
/// never happened are also no-ops.
#[async_trait]
pub trait LedgerLeaf: Send + Sync {
    fn ledger_id(&self) -> &str;

    fn ledger_type(&self) -> LedgerType;

    /// Account that holders must approve before their assets can be locked.
    async fn approve_address(&self, token_type: &str) -> Result<String, LedgerError>;

    /// Register `asset` with the bridge under `asset.token_id`.
    async fn wrap_asset(&self, asset: &Asset) -> Result<Receipt, LedgerError>;

    /// Move `amount` from the owner into bridge escrow.
    async fn lock_asset(&self, asset_id: &str, amount: u64) -> Result<Receipt, LedgerError>;

    /// Return escrowed funds to the owner. Compensates `lock`.
    async fn unlock_asset(&self, asset_id: &str, amount: u64) -> Result<Receipt, LedgerError>;

    /// Create `amount` on the bridge account.
    async fn mint_asset(&self, asset_id: &str, amount: u64) -> Result<Receipt, LedgerError>;

    /// Destroy `amount` held by the bridge. Finalizes a lock or compensates
    /// a mint.
    async fn burn_asset(&self, asset_id: &str, amount: u64) -> Result<Receipt, LedgerError>;

    /// Move minted funds from the bridge to `owner`.
    async fn assign_asset(
        &self,
        asset_id: &str,
        owner: &str,
        amount: u64,
    ) -> Result<Receipt, LedgerError>;
}
