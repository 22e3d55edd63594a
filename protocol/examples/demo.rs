//! Two-gateway SATP walkthrough.
//!
//! Starts gateway A (fronting a Besu ledger) and gateway B (fronting a
//! Fabric ledger) in one process, runs a transfer end to end, then breaks
//! the network mid-transfer and lets crash recovery roll it back.
//!
//! Run with:
//!   cargo run --example demo --release

use std::sync::Arc;
use std::time::Instant;

use satp_protocol::asset::Asset;
use satp_protocol::config::{GatewayConfig, SIGNING_ALGORITHM};
use satp_protocol::crosschain::{InMemoryLedger, LeafRegistry};
use satp_protocol::crypto::GatewayKeypair;
use satp_protocol::identity::{GatewayIdentity, LedgerType, NetworkId};
use satp_protocol::log::SledLogStore;
use satp_protocol::messages::MessageType;
use satp_protocol::orchestrator::{LocalNetwork, MessageHandler};
use satp_protocol::{Gateway, TransactRequest};

// ---------------------------------------------------------------------------
// ANSI color constants
// ---------------------------------------------------------------------------

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const MAGENTA: &str = "\x1b[35m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";
const RED: &str = "\x1b[31m";

const BG_BLUE: &str = "\x1b[44m";

// ---------------------------------------------------------------------------
// Display helpers
// ---------------------------------------------------------------------------

fn banner() {
    println!();
    println!("{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}");
    println!("{BG_BLUE}{BOLD}{WHITE}    SATP GATEWAY  --  Cross-Chain Transfer Demo                     {RESET}");
    println!("{BG_BLUE}{BOLD}{WHITE}    Besu -> Fabric  |  Ed25519 + SHA-256  |  sled protocol log      {RESET}");
    println!("{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}");
    println!();
}

fn section(num: u32, title: &str) {
    println!();
    println!("{BOLD}{CYAN}===[{YELLOW} Step {num} {CYAN}]=============================================================={RESET}");
    println!("{BOLD}{WHITE}  {title}{RESET}");
    println!("{CYAN}------------------------------------------------------------------------{RESET}");
}

fn subsection(text: &str) {
    println!("{DIM}{CYAN}  >> {text}{RESET}");
}

fn success(text: &str) {
    println!("{GREEN}  [OK] {text}{RESET}");
}

fn failure(text: &str) {
    println!("{RED}  [!!] {text}{RESET}");
}

fn info(label: &str, value: &str) {
    println!("{WHITE}  {BOLD}{label}:{RESET} {YELLOW}{value}{RESET}");
}

fn timing(label: &str, elapsed: std::time::Duration) {
    let ms = elapsed.as_secs_f64() * 1000.0;
    println!("{DIM}{MAGENTA}  [{label}: {ms:.2} ms]{RESET}");
}

fn balances(besu: &InMemoryLedger, fabric: &InMemoryLedger) {
    for (name, ledger, owner) in [
        ("alice@besu", besu, "alice"),
        ("bridge@besu", besu, "satp-bridge"),
        ("bob@fabric", fabric, "bob"),
        ("bridge@fabric", fabric, "satp-bridge"),
    ] {
        let balance = ledger.balance_of(owner, "USDC");
        println!("  {CYAN}{BOLD}{name:<14}{RESET}  {WHITE}{balance:>8}{RESET} {DIM}USDC{RESET}");
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn identity(id: &str, keypair: &GatewayKeypair, network: &str, ledger_type: LedgerType) -> GatewayIdentity {
    GatewayIdentity {
        id: id.into(),
        name: id.to_uppercase(),
        pubkey: keypair.public_key(),
        signing_algorithm: SIGNING_ALGORITHM.into(),
        connected_ledgers: vec![NetworkId {
            id: network.into(),
            ledger_type,
        }],
        address: "in-process".into(),
        server_port: 0,
        client_port: 0,
        oapi_port: 0,
    }
}

fn gateway(
    me: GatewayIdentity,
    peer: GatewayIdentity,
    keypair: GatewayKeypair,
    ledger: Arc<InMemoryLedger>,
    net: &Arc<LocalNetwork>,
) -> Arc<Gateway> {
    let mut config = GatewayConfig::new(me);
    config.known_gateways.push(peer);
    config.session.max_retries = 2;
    config.session.max_timeout_ms = 1_000;
    config.session.attempt_timeout_ms = 200;
    config.recovery.enabled = false;

    let logs = Arc::new(SledLogStore::open_temporary().expect("temporary log"));
    let gateway = Arc::new(
        Gateway::from_parts(&config, keypair, net.clone(), LeafRegistry::new().with(ledger), logs)
            .expect("gateway"),
    );
    let handler: Arc<dyn MessageHandler> = gateway.clone();
    net.register(gateway.identity().id.clone(), &handler);
    gateway
}

fn request(amount: u64) -> TransactRequest {
    TransactRequest {
        context_id: "demo".into(),
        sender: "alice".into(),
        receiver: "bob".into(),
        source_asset: Asset::fungible("", "USDC", amount, "alice", "besu"),
        receiver_asset: Asset::fungible("", "USDC", amount, "bob", "fabric"),
        source_amount: amount,
        receiver_amount: amount,
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let demo_start = Instant::now();
    banner();

    // -----------------------------------------------------------------------
    // Step 1: Gateways and ledgers
    // -----------------------------------------------------------------------

    section(1, "Two Gateways, Two Ledgers");
    subsection("Generating Ed25519 gateway keys...");
    let (key_a, key_b) = (GatewayKeypair::generate(), GatewayKeypair::generate());
    let id_a = identity("gw-a", &key_a, "besu", LedgerType::Besu);
    let id_b = identity("gw-b", &key_b, "fabric", LedgerType::Fabric);
    info("gateway A", &key_a.public_key().to_hex());
    info("gateway B", &key_b.public_key().to_hex());

    let besu = Arc::new(InMemoryLedger::new("besu", LedgerType::Besu, "satp-bridge"));
    let fabric = Arc::new(InMemoryLedger::new("fabric", LedgerType::Fabric, "satp-bridge"));
    besu.credit("alice", "USDC", 1_000);
    besu.approve("alice", "USDC", 300);

    let net = LocalNetwork::new();
    let a = gateway(id_a.clone(), id_b.clone(), key_a, besu.clone(), &net);
    let b = gateway(id_b, id_a, key_b, fabric.clone(), &net);
    a.startup().await.expect("startup A");
    b.startup().await.expect("startup B");

    let approve = a.get_approve_address("besu", "USDC").await.expect("approve address");
    info("approve address", &approve.approve_address);
    success("Alice holds 1000 USDC on Besu and approved 300 to the bridge");
    balances(&besu, &fabric);

    // -----------------------------------------------------------------------
    // Step 2: A clean transfer
    // -----------------------------------------------------------------------

    section(2, "Transfer 100 USDC: Stages 0 to 3");
    subsection("new session, pre-transfer, proposal, lock, commit...");
    let started = Instant::now();
    match a.transact(request(100)).await {
        Ok(response) => {
            timing("transfer", started.elapsed());
            info("session", &response.session_id);
            if let Ok(status) = a.session_status(&response.session_id) {
                info("stages completed", &status.completed_stages.to_string());
                info("messages exchanged", &status.last_sequence_number.to_string());
            }
            success("transfer completed");
        }
        Err(e) => failure(&format!("transfer failed: {e}")),
    }
    balances(&besu, &fabric);

    // -----------------------------------------------------------------------
    // Step 3: A crash after the lock
    // -----------------------------------------------------------------------

    section(3, "Network Fault After Lock, Then Rollback");
    subsection("gateway B stops receiving lock assertions...");
    net.drop_messages("gw-b", MessageType::LockAssertionRequest);
    match a.transact(request(100)).await {
        Ok(_) => failure("transfer unexpectedly completed"),
        Err(e) => failure(&format!("transfer interrupted: {e}")),
    }
    balances(&besu, &fabric);

    subsection("running the crash manager...");
    let started = Instant::now();
    match a.crash_manager().check_and_resolve_crashes().await {
        Ok(report) => {
            timing("recovery", started.elapsed());
            info("rolled back", &report.rolled_back.len().to_string());
            info("rolled forward", &report.rolled_forward.len().to_string());
            success("escrow released back to Alice");
        }
        Err(e) => failure(&format!("recovery failed: {e}")),
    }
    balances(&besu, &fabric);
    net.heal("gw-b");

    // -----------------------------------------------------------------------
    // Step 4: Metrics
    // -----------------------------------------------------------------------

    section(4, "Gateway A Metrics");
    if let Ok(text) = a.monitor().encode() {
        for line in text.lines().filter(|l| !l.starts_with('#') && l.contains("_total")) {
            println!("  {DIM}{line}{RESET}");
        }
    }

    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
    println!();
    timing("demo total", demo_start.elapsed());
    println!();
}
