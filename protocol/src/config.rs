//! # Gateway Configuration & Constants
//!
//! Protocol constants live at the top of this file; the serde-backed
//! [`GatewayConfig`] that a node loads from disk lives at the bottom.
//! Defaults for every tunable come from the constants, so a config file
//! only needs to name what it changes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::crypto::GatewayKeypair;
use crate::identity::{GatewayIdentity, NetworkId};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// SATP draft version carried in every message envelope.
pub const SATP_VERSION: &str = "v02";

/// Crate-level protocol implementation version, reported by `/status`.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

pub const SIGNING_ALGORITHM: &str = "Ed25519";

pub const HASH_FUNCTION: &str = "SHA-256";

// ---------------------------------------------------------------------------
// Retry & Timing
// ---------------------------------------------------------------------------

/// Retries allowed per transfer (not per stage) before the session fails.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Wall-clock budget for a whole transfer, all stages and retries included.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single round trip or ledger call. Shorter than the
/// transfer budget so several attempts fit inside it.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Floor for the per-attempt timeout once the remaining budget gets small.
pub const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(5);

/// First backoff between retries; doubles per retry up to [`MAX_RETRY_BACKOFF`].
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(20);

pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// How often the crash manager scans for stale sessions.
pub const DEFAULT_CRASH_SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// Compensation attempts per rollback cycle for a single ledger operation.
pub const MAX_COMPENSATION_ATTEMPTS: u32 = 3;

/// Completed sessions stay queryable in memory for this long.
pub const DEFAULT_COMPLETED_SESSION_TTL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Largest gateway-to-gateway frame accepted over TCP.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

pub const DEFAULT_SERVER_PORT: u16 = 3010;

pub const DEFAULT_API_PORT: u16 = 4010;

pub const DEFAULT_METRICS_PORT: u16 = 4011;

/// Capacity of the bounded ledger-receipt channel.
pub const RECEIPT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Session Policy
// ---------------------------------------------------------------------------

/// Retry and timeout discipline applied to every session this gateway starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    pub max_retries: u32,
    pub max_timeout_ms: u64,
    pub attempt_timeout_ms: u64,
    pub retry_backoff_ms: u64,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_timeout_ms: DEFAULT_MAX_TIMEOUT.as_millis() as u64,
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT.as_millis() as u64,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF.as_millis() as u64,
        }
    }
}

impl SessionPolicy {
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Backoff before retry number `retry` (1-based), capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let ms = self.retry_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms).min(MAX_RETRY_BACKOFF)
    }
}

// ---------------------------------------------------------------------------
// Crash Recovery
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub scan_interval_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_ms: DEFAULT_CRASH_SCAN_INTERVAL.as_millis() as u64,
        }
    }
}

impl RecoveryConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Ledgers
// ---------------------------------------------------------------------------

/// A ledger this gateway fronts. For in-memory ledgers the optional
/// `genesis` accounts are credited at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub network: NetworkId,
    /// Escrow/bridge account that holds locked and freshly minted funds.
    #[serde(default = "default_bridge_account")]
    pub bridge_account: String,
    #[serde(default)]
    pub genesis: Vec<GenesisAccount>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub owner: String,
    pub token_type: String,
    pub balance: u64,
    /// Pre-approved allowance towards the bridge account.
    #[serde(default)]
    pub allowance: u64,
}

fn default_bridge_account() -> String {
    "satp-bridge".to_string()
}

// ---------------------------------------------------------------------------
// GatewayConfig
// ---------------------------------------------------------------------------

/// Full configuration of one gateway node, loaded from a JSON file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// This gateway's own identity. Its `pubkey` must match the signing key.
    pub identity: GatewayIdentity,
    /// Counterparty gateways this node will talk to. Seeded once at startup.
    #[serde(default)]
    pub known_gateways: Vec<GatewayIdentity>,
    #[serde(default)]
    pub ledgers: Vec<LedgerConfig>,
    #[serde(default)]
    pub session: SessionPolicy,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default = "default_completed_ttl_ms")]
    pub completed_session_ttl_ms: u64,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Hex Ed25519 seed. Nodes may instead take the key from the command
    /// line or environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

fn default_completed_ttl_ms() -> u64 {
    DEFAULT_COMPLETED_SESSION_TTL.as_millis() as u64
}

/// Errors surfaced while loading or validating a [`GatewayConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl GatewayConfig {
    /// Minimal config for a gateway with no peers or ledgers yet.
    pub fn new(identity: GatewayIdentity) -> Self {
        Self {
            identity,
            known_gateways: Vec::new(),
            ledgers: Vec::new(),
            session: SessionPolicy::default(),
            recovery: RecoveryConfig::default(),
            completed_session_ttl_ms: default_completed_ttl_ms(),
            data_dir: None,
            secret_key: None,
        }
    }

    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn completed_session_ttl(&self) -> Duration {
        Duration::from_millis(self.completed_session_ttl_ms)
    }

    /// Keypair from `secret_key`, checked against `identity.pubkey`.
    pub fn keypair(&self) -> Result<Option<GatewayKeypair>, ConfigError> {
        let Some(secret) = &self.secret_key else {
            return Ok(None);
        };
        let keypair = GatewayKeypair::from_hex(secret)
            .map_err(|e| ConfigError::Invalid(format!("secret_key: {}", e)))?;
        if keypair.public_key() != self.identity.pubkey {
            return Err(ConfigError::Invalid(
                "secret_key does not match identity.pubkey".into(),
            ));
        }
        Ok(Some(keypair))
    }

    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.id.is_empty() {
            return Err(ConfigError::Invalid("identity.id is empty".into()));
        }
        if self.session.max_timeout_ms == 0 {
            return Err(ConfigError::Invalid("session.max_timeout_ms must be > 0".into()));
        }
        if self.session.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "session.attempt_timeout_ms must be > 0".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for gw in &self.known_gateways {
            if gw.id == self.identity.id {
                return Err(ConfigError::Invalid(format!(
                    "known gateway {} has this gateway's own id",
                    gw.id
                )));
            }
            if !seen.insert(gw.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate known gateway {}", gw.id)));
            }
        }
        for ledger in &self.ledgers {
            if !self.identity.serves_network(&ledger.network.id) {
                return Err(ConfigError::Invalid(format!(
                    "ledger {} is not listed in identity.connected_ledgers",
                    ledger.network.id
                )));
            }
        }
        Ok(())
    }
}
