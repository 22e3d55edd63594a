//! # Gateway Identity
//!
//! The immutable description of a gateway node: who it is, which key signs
//! its messages, which ledgers it fronts, and where to reach it. A gateway
//! learns its counterparties' identities from configuration at startup and
//! never changes them while running.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config;
use crate::crypto::GatewayPublicKey;

/// Kind of ledger a gateway fronts. Selects the ledger leaf implementation
/// at configuration time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerType {
    Besu,
    Ethereum,
    Fabric,
    InMemory,
}

impl fmt::Display for LedgerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LedgerType::Besu => "BESU",
            LedgerType::Ethereum => "ETHEREUM",
            LedgerType::Fabric => "FABRIC",
            LedgerType::InMemory => "IN_MEMORY",
        };
        f.write_str(s)
    }
}

/// A ledger network reachable through a gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkId {
    /// Network identifier, unique across the deployment (e.g. `"besu-main"`).
    pub id: String,
    pub ledger_type: LedgerType,
}

/// Everything a gateway publishes about itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayIdentity {
    pub id: String,
    pub name: String,
    pub pubkey: GatewayPublicKey,
    #[serde(default = "default_signing_algorithm")]
    pub signing_algorithm: String,
    #[serde(default)]
    pub connected_ledgers: Vec<NetworkId>,
    pub address: String,
    /// Port of the gateway-to-gateway listener.
    pub server_port: u16,
    #[serde(default)]
    pub client_port: u16,
    /// Port of the HTTP API.
    #[serde(default)]
    pub oapi_port: u16,
}

fn default_signing_algorithm() -> String {
    config::SIGNING_ALGORITHM.to_string()
}

impl GatewayIdentity {
    /// Whether this gateway fronts the given network.
    pub fn serves_network(&self, network_id: &str) -> bool {
        self.connected_ledgers.iter().any(|l| l.id == network_id)
    }

    /// `address:server_port`, the endpoint counterparties dial.
    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.address, self.server_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::GatewayKeypair;

    fn identity() -> GatewayIdentity {
        GatewayIdentity {
            id: "gw-a".into(),
            name: "Gateway A".into(),
            pubkey: GatewayKeypair::from_seed(&[1u8; 32]).public_key(),
            signing_algorithm: default_signing_algorithm(),
            connected_ledgers: vec![NetworkId {
                id: "besu-main".into(),
                ledger_type: LedgerType::Besu,
            }],
            address: "127.0.0.1".into(),
            server_port: 3010,
            client_port: 3011,
            oapi_port: 4010,
        }
    }

    #[test]
    fn serves_only_connected_networks() {
        let gw = identity();
        assert!(gw.serves_network("besu-main"));
        assert!(!gw.serves_network("fabric-main"));
        assert_eq!(gw.server_endpoint(), "127.0.0.1:3010");
    }

    #[test]
    fn ledger_type_wire_names() {
        let json = serde_json::to_string(&LedgerType::InMemory).unwrap();
        assert_eq!(json, "\"IN_MEMORY\"");
        assert_eq!(LedgerType::Fabric.to_string(), "FABRIC");
    }

    #[test]
    fn identity_defaults_fill_optional_fields() {
        let pk = GatewayKeypair::from_seed(&[2u8; 32]).public_key();
        let json = format!(
            r#"{{"id":"gw-b","name":"B","pubkey":"{}","address":"localhost","server_port":3110}}"#,
            pk.to_hex()
        );
        let gw: GatewayIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(gw.signing_algorithm, "Ed25519");
        assert!(gw.connected_ledgers.is_empty());
        assert_eq!(gw.oapi_port, 0);
    }
}
