//! # Ledger-Agnostic Asset Descriptor
//!
//! An [`Asset`] names a quantity of some token on some network without
//! committing to how that network represents it. Ledger leafs translate it
//! into contract calls (EVM ledgers use `contract_address`, Fabric uses
//! `channel_name` + `msp_id`).

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Identifier of the wrapped asset; unique per transfer leg.
    pub token_id: String,
    /// Caller-supplied reference (e.g. an ontology or token-class id).
    #[serde(default)]
    pub reference_id: String,
    /// Token type, e.g. `"FUNGIBLE"` or a token symbol.
    pub token_type: String,
    pub amount: u64,
    /// Account that owns the asset before (source) or after (destination)
    /// the transfer.
    pub owner: String,
    #[serde(default)]
    pub contract_name: String,
    #[serde(flatten)]
    pub location: ContractLocation,
    /// Ledger network id the asset lives on.
    pub network: String,
}

/// Where the token contract lives on its ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContractLocation {
    Evm {
        contract_address: String,
    },
    Fabric {
        channel_name: String,
        msp_id: String,
    },
    Unspecified {},
}

impl Default for ContractLocation {
    fn default() -> Self {
        ContractLocation::Unspecified {}
    }
}

impl Asset {
    /// Minimal asset used by in-memory ledgers and tests.
    pub fn fungible(
        token_id: impl Into<String>,
        token_type: impl Into<String>,
        amount: u64,
        owner: impl Into<String>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            token_id: token_id.into(),
            reference_id: String::new(),
            token_type: token_type.into(),
            amount,
            owner: owner.into(),
            contract_name: String::new(),
            location: ContractLocation::default(),
            network: network.into(),
        }
    }
}
