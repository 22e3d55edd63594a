//! # CLI Interface
//!
//! Command-line argument structure for `satp-node`, built with `clap`
//! derive. Every flag that matters in a deployment also reads from a
//! `SATP_*` environment variable.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// SATP gateway node.
///
/// Runs one gateway: the gateway-to-gateway listener, the HTTP API and the
/// Prometheus metrics endpoint.
#[derive(Parser, Debug)]
#[command(
    name = "satp-node",
    about = "SATP cross-chain asset transfer gateway",
    version,
    propagate_version = true
)]
pub struct SatpNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway.
    Run(RunArgs),
    /// Create a data directory with a fresh gateway key and a starter
    /// configuration.
    Init(InitArgs),
    /// Query a running gateway's status endpoint.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the gateway configuration file (JSON).
    ///
    /// When omitted, the node looks for `gateway.json` in the data directory.
    #[arg(long, short = 'c', env = "SATP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory holding the protocol log and the gateway key.
    /// Overrides `data_dir` from the configuration file.
    #[arg(long, short = 'd', env = "SATP_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Hex-encoded Ed25519 gateway key. Falls back to `secret_key` in the
    /// configuration, then to `gateway.key` in the data directory.
    #[arg(long, env = "SATP_GATEWAY_KEY", hide_env_values = true)]
    pub gateway_key: Option<String>,

    /// Port for the HTTP API. Overrides `identity.oapi_port`.
    #[arg(long, env = "SATP_API_PORT")]
    pub api_port: Option<u16>,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "SATP_METRICS_PORT", default_value_t = satp_protocol::config::DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Log output format.
    #[arg(long, env = "SATP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "SATP_DATA_DIR", default_value = "./satp-data")]
    pub data_dir: PathBuf,

    /// Gateway id written to the starter configuration.
    #[arg(long, default_value = "gateway-1")]
    pub id: String,

    /// Ledger network the gateway fronts.
    #[arg(long, default_value = "besu-devnet")]
    pub network: String,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// HTTP API of the running gateway.
    #[arg(long, env = "SATP_API_URL", default_value = "http://127.0.0.1:4010")]
    pub api_url: String,
}
