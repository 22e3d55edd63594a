// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # SATP Gateway Node
//!
//! Entry point for the `satp-node` binary. Parses CLI arguments, sets up
//! logging, assembles the gateway from its configuration file and serves
//! three listeners: gateway-to-gateway TCP, the HTTP API and metrics.
//!
//! The binary supports four subcommands:
//!
//! - `run`: start the gateway
//! - `init`: create a data directory, a gateway key and a starter config
//! - `status`: query a running gateway's status endpoint
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

use satp_protocol::config::{
    GatewayConfig, LedgerConfig, DEFAULT_API_PORT, DEFAULT_SERVER_PORT, SIGNING_ALGORITHM,
};
use satp_protocol::crypto::GatewayKeypair;
use satp_protocol::identity::{GatewayIdentity, LedgerType, NetworkId};
use satp_protocol::orchestrator::{serve_tcp, MessageHandler, TcpChannel};
use satp_protocol::Gateway;

use cli::{Commands, SatpNodeCli};
use logging::LogFormat;

const CONFIG_FILE: &str = "gateway.json";
const KEY_FILE: &str = "gateway.key";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = SatpNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => {
            logging::init_logging("satp_node=info", LogFormat::Pretty);
            let (config_path, key_path) = init_node(&args.data_dir, &args.id, &args.network)?;
            println!("Gateway initialized.");
            println!("  Data directory : {}", args.data_dir.display());
            println!("  Config         : {}", config_path.display());
            println!("  Gateway key    : {}", key_path.display());
            Ok(())
        }
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the gateway and serves until SIGINT/SIGTERM.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "satp_node=info,satp_protocol=info,tower_http=info",
        args.log_format,
    );

    // --- Configuration ---
    let config_path = match (&args.config, &args.data_dir) {
        (Some(path), _) => path.clone(),
        (None, Some(dir)) => dir.join(CONFIG_FILE),
        (None, None) => PathBuf::from(CONFIG_FILE),
    };
    let mut config = GatewayConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(port) = args.api_port {
        config.identity.oapi_port = port;
    }
    if let Some(dir) = &config.data_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data directory: {}", dir.display()))?;
    }

    let keypair = load_keypair(&args, &config)?;

    tracing::info!(
        gateway = %config.identity.id,
        server_port = config.identity.server_port,
        api_port = config.identity.oapi_port,
        metrics_port = args.metrics_port,
        ledgers = config.ledgers.len(),
        known_gateways = config.known_gateways.len(),
        "starting satp-node"
    );

    // --- Gateway ---
    let gateway = Arc::new(
        Gateway::from_config(&config, keypair, Arc::new(TcpChannel::default()))
            .context("failed to assemble gateway")?,
    );
    let report = gateway.startup().await.context("startup recovery pass failed")?;
    if !report.pending.is_empty() {
        tracing::warn!(pending = report.pending.len(), "sessions still awaiting recovery");
    }

    // --- Gateway-to-gateway listener ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_addr = format!("0.0.0.0:{}", config.identity.server_port);
    let server_listener = tokio::net::TcpListener::bind(&server_addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {}", server_addr))?;
    let handler: Arc<dyn MessageHandler> = gateway.clone();
    let satp_server = tokio::spawn(serve_tcp(server_listener, handler, shutdown_rx));

    // --- API server ---
    let app_state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            satp_protocol::config::PROTOCOL_VERSION,
        ),
        gateway: gateway.clone(),
    };
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", config.identity.oapi_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(gateway.monitor().clone());
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    match satp_server.await {
        Ok(Err(e)) => tracing::error!("gateway listener error: {}", e),
        Err(e) => tracing::error!("gateway listener task failed: {}", e),
        Ok(Ok(())) => {}
    }
    gateway.shutdown().await.context("gateway shutdown failed")?;
    tracing::info!("satp-node stopped");
    Ok(())
}

/// Key from the command line or environment, then the config file, then
/// `gateway.key` in the data directory.
fn load_keypair(args: &cli::RunArgs, config: &GatewayConfig) -> Result<GatewayKeypair> {
    if let Some(hex_key) = &args.gateway_key {
        let keypair = GatewayKeypair::from_hex(hex_key.trim()).context("invalid --gateway-key")?;
        if keypair.public_key() != config.identity.pubkey {
            return Err(anyhow!("--gateway-key does not match identity.pubkey"));
        }
        return Ok(keypair);
    }
    if let Some(keypair) = config.keypair()? {
        return Ok(keypair);
    }
    let dir = config
        .data_dir
        .as_deref()
        .ok_or_else(|| anyhow!("no gateway key: pass --gateway-key or set data_dir"))?;
    let key_path = dir.join(KEY_FILE);
    let raw = std::fs::read_to_string(&key_path)
        .with_context(|| format!("failed to read gateway key from {}", key_path.display()))?;
    let keypair = GatewayKeypair::from_hex(raw.trim())
        .with_context(|| format!("invalid gateway key in {}", key_path.display()))?;
    if keypair.public_key() != config.identity.pubkey {
        return Err(anyhow!("{} does not match identity.pubkey", key_path.display()));
    }
    Ok(keypair)
}

/// Creates `data_dir` with a fresh gateway key and a starter config that
/// fronts one in-memory ledger. Returns the config and key paths.
fn init_node(data_dir: &Path, id: &str, network: &str) -> Result<(PathBuf, PathBuf)> {
    tracing::info!(data_dir = %data_dir.display(), gateway = %id, "initializing gateway");
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let keypair = GatewayKeypair::generate();
    let key_path = data_dir.join(KEY_FILE);
    std::fs::write(&key_path, keypair.secret_key_hex())
        .with_context(|| format!("failed to write gateway key to {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    let network = NetworkId {
        id: network.to_string(),
        ledger_type: LedgerType::InMemory,
    };
    let mut config = GatewayConfig::new(GatewayIdentity {
        id: id.to_string(),
        name: id.to_string(),
        pubkey: keypair.public_key(),
        signing_algorithm: SIGNING_ALGORITHM.to_string(),
        connected_ledgers: vec![network.clone()],
        address: "127.0.0.1".to_string(),
        server_port: DEFAULT_SERVER_PORT,
        client_port: 0,
        oapi_port: DEFAULT_API_PORT,
    });
    config.ledgers.push(LedgerConfig {
        network,
        bridge_account: "satp-bridge".to_string(),
        genesis: Vec::new(),
    });
    config.data_dir = Some(data_dir.to_path_buf());

    let config_path = data_dir.join(CONFIG_FILE);
    let json = serde_json::to_string_pretty(&config)?;
    std::fs::write(&config_path, json)
        .with_context(|| format!("failed to write config to {}", config_path.display()))?;

    tracing::info!(public_key = %keypair.public_key(), "gateway key generated");
    Ok((config_path, key_path))
}

/// Queries a running gateway's `/status` and prints the body.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.api_url.trim_end_matches('/'));
    let body = http_get(&url).await?;
    println!("{}", body);
    Ok(())
}

/// Plain HTTP/1.1 GET over a tokio TCP stream.
async fn http_get(url: &str) -> Result<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| anyhow!("only http:// URLs are supported: {}", url))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let addr = if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{}:80", authority)
    };

    let mut stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, authority,
    );
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_else(|| response.to_string());
    Ok(body)
}

fn print_version() {
    println!("satp-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol  {}", satp_protocol::config::PROTOCOL_VERSION);
    println!("satp      {}", satp_protocol::config::SATP_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_a_loadable_config_and_matching_key() {
        let dir = tempfile::tempdir().unwrap();
        let (config_path, key_path) = init_node(dir.path(), "gw-test", "besu-devnet").unwrap();

        let config = GatewayConfig::load(&config_path).unwrap();
        assert_eq!(config.identity.id, "gw-test");
        assert_eq!(config.ledgers[0].network.id, "besu-devnet");

        let raw = std::fs::read_to_string(key_path).unwrap();
        let keypair = GatewayKeypair::from_hex(raw.trim()).unwrap();
        assert_eq!(keypair.public_key(), config.identity.pubkey);
    }

    #[test]
    fn key_falls_back_to_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (config_path, _) = init_node(dir.path(), "gw-test", "besu-devnet").unwrap();
        let config = GatewayConfig::load(&config_path).unwrap();

        let args = cli::RunArgs {
            config: Some(config_path),
            data_dir: None,
            gateway_key: None,
            api_port: None,
            metrics_port: 0,
            log_format: LogFormat::Pretty,
        };
        let keypair = load_keypair(&args, &config).unwrap();
        assert_eq!(keypair.public_key(), config.identity.pubkey);

        let wrong = cli::RunArgs {
            gateway_key: Some(GatewayKeypair::generate().secret_key_hex()),
            ..args
        };
        assert!(load_keypair(&wrong, &config).is_err());
    }
}
