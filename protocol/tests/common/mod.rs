//! Two gateways wired over the in-process network.
//!
//! Gateway A fronts a Besu ledger, gateway B a Fabric ledger. Each has its
//! own log store; the ledgers are handed back so tests can check balances.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use satp_protocol::asset::Asset;
use satp_protocol::config::{GatewayConfig, SessionPolicy, SIGNING_ALGORITHM};
use satp_protocol::crosschain::{InMemoryLedger, LeafRegistry};
use satp_protocol::crypto::GatewayKeypair;
use satp_protocol::identity::{GatewayIdentity, LedgerType, NetworkId};
use satp_protocol::log::{LogRepository, SledLogStore};
use satp_protocol::orchestrator::{LocalNetwork, MessageHandler};
use satp_protocol::{Gateway, TransactRequest};

pub const BESU: &str = "besu";
pub const FABRIC: &str = "fabric";
pub const TOKEN: &str = "USDC";
pub const BRIDGE: &str = "satp-bridge";
pub const ALICE: &str = "alice";
pub const BOB: &str = "bob";

pub fn policy() -> SessionPolicy {
    SessionPolicy {
        max_retries: 3,
        max_timeout_ms: 2_000,
        attempt_timeout_ms: 500,
        retry_backoff_ms: 5,
    }
}

pub fn identity(id: &str, keypair: &GatewayKeypair, network: NetworkId) -> GatewayIdentity {
    GatewayIdentity {
        id: id.into(),
        name: id.to_uppercase(),
        pubkey: keypair.public_key(),
        signing_algorithm: SIGNING_ALGORITHM.into(),
        connected_ledgers: vec![network],
        address: "in-process".into(),
        server_port: 0,
        client_port: 0,
        oapi_port: 0,
    }
}

pub fn besu_network() -> NetworkId {
    NetworkId {
        id: BESU.into(),
        ledger_type: LedgerType::Besu,
    }
}

pub fn fabric_network() -> NetworkId {
    NetworkId {
        id: FABRIC.into(),
        ledger_type: LedgerType::Fabric,
    }
}

pub fn keypair_a() -> GatewayKeypair {
    GatewayKeypair::from_seed(&[0xA1; 32])
}

pub fn keypair_b() -> GatewayKeypair {
    GatewayKeypair::from_seed(&[0xB2; 32])
}

/// A third gateway on its own network, known to the others but never part
/// of their sessions.
pub fn keypair_c() -> GatewayKeypair {
    GatewayKeypair::from_seed(&[0xC3; 32])
}

pub fn identity_c() -> GatewayIdentity {
    identity(
        "gw-c",
        &keypair_c(),
        NetworkId {
            id: "polygon".into(),
            ledger_type: LedgerType::Besu,
        },
    )
}

pub fn config_a(policy: SessionPolicy) -> GatewayConfig {
    let mut config = GatewayConfig::new(identity("gw-a", &keypair_a(), besu_network()));
    config.known_gateways.push(identity("gw-b", &keypair_b(), fabric_network()));
    config.session = policy;
    config.recovery.enabled = false;
    config
}

pub fn config_b(policy: SessionPolicy) -> GatewayConfig {
    let mut config = GatewayConfig::new(identity("gw-b", &keypair_b(), fabric_network()));
    config.known_gateways.push(identity("gw-a", &keypair_a(), besu_network()));
    config.session = policy;
    config.recovery.enabled = false;
    config
}

pub struct Testbed {
    pub net: Arc<LocalNetwork>,
    pub a: Arc<Gateway>,
    pub b: Arc<Gateway>,
    pub besu: Arc<InMemoryLedger>,
    pub fabric: Arc<InMemoryLedger>,
}

impl Testbed {
    /// Alice holds 1000 on Besu with an allowance of 100 towards the bridge.
    pub fn new() -> Self {
        Self::with_policy(policy())
    }

    pub fn with_policy(policy: SessionPolicy) -> Self {
        Self::with_configs(config_a(policy.clone()), config_b(policy))
    }

    pub fn with_configs(config_a: GatewayConfig, config_b: GatewayConfig) -> Self {
        let besu = Arc::new(InMemoryLedger::new(BESU, LedgerType::Besu, BRIDGE));
        besu.credit(ALICE, TOKEN, 1_000);
        besu.approve(ALICE, TOKEN, 100);
        let fabric = Arc::new(InMemoryLedger::new(FABRIC, LedgerType::Fabric, BRIDGE));

        let net = LocalNetwork::new();
        let a = gateway_from(&net, &config_a, keypair_a(), &besu, temporary_log());
        let b = gateway_from(&net, &config_b, keypair_b(), &fabric, temporary_log());

        Self {
            net,
            a,
            b,
            besu,
            fabric,
        }
    }
}

/// Gateway A over `besu`, registered on `net`.
pub fn gateway_a(
    net: &Arc<LocalNetwork>,
    besu: &Arc<InMemoryLedger>,
    policy: SessionPolicy,
    logs: Arc<dyn LogRepository>,
) -> Arc<Gateway> {
    gateway_from(net, &config_a(policy), keypair_a(), besu, logs)
}

/// A gateway over the single ledger `ledger`, registered on `net`.
pub fn gateway_from(
    net: &Arc<LocalNetwork>,
    config: &GatewayConfig,
    keypair: GatewayKeypair,
    ledger: &Arc<InMemoryLedger>,
    logs: Arc<dyn LogRepository>,
) -> Arc<Gateway> {
    let gateway = Arc::new(
        Gateway::from_parts(config, keypair, net.clone(), LeafRegistry::new().with(ledger.clone()), logs)
            .unwrap(),
    );
    register(net, &gateway);
    gateway
}

pub fn temporary_log() -> Arc<dyn LogRepository> {
    Arc::new(SledLogStore::open_temporary().unwrap())
}

pub fn sled_at(path: &Path) -> Arc<dyn LogRepository> {
    Arc::new(SledLogStore::open(path).unwrap())
}

/// The network only keeps weak handles; the gateway's own `Arc` keeps the
/// route alive.
pub fn register(net: &LocalNetwork, gateway: &Arc<Gateway>) {
    let handler: Arc<dyn MessageHandler> = gateway.clone();
    net.register(gateway.identity().id.clone(), &handler);
}

/// Alice on Besu sends `amount` to Bob on Fabric.
pub fn transfer(amount: u64) -> TransactRequest {
    transfer_between(ALICE, BOB, amount)
}

pub fn transfer_between(sender: &str, receiver: &str, amount: u64) -> TransactRequest {
    TransactRequest {
        context_id: "ctx-1".into(),
        sender: sender.into(),
        receiver: receiver.into(),
        source_asset: Asset::fungible("", TOKEN, amount, sender, BESU),
        receiver_asset: Asset::fungible("", TOKEN, amount, receiver, FABRIC),
        source_amount: amount,
        receiver_amount: amount,
    }
}
