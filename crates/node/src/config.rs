//! Node configuration.
//!
//! Configuration is read from `OREN_*` environment variables with
//! [`NodeConfig::from_env`]; the binary layers optional CLI flags on top
//! of that. Everything has a default except the pieces that identify an
//! actual deployment, so `oren-node` with no environment at all comes up
//! against the in-process emulator.
//!
//! ## Environment variables
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `OREN_NODE_ID` | `auto` | Node identifier; `auto` generates a UUID. |
//! | `OREN_APP` | `dapp` | Application whose inputs this node executes. |
//! | `OREN_MACHINE_ENDPOINT` | `mock` | Machine manager `host:port`, or `mock`. |
//! | `OREN_SNAPSHOT_PATH` | — | Snapshot directory; required unless `mock`. |
//! | `OREN_MACHINE_MANAGER_BIN` | — | Manager binary to spawn and supervise. |
//! | `OREN_MACHINE_MANAGER_ARGS` | — | Extra manager arguments, whitespace split. |
//! | `OREN_MANAGER_HEALTHCHECK_PORT` | `0` | Manager probe port; `0` scans stderr. |
//! | `OREN_MANAGER_BYPASS_LOG` | `false` | Pass manager stdio through untouched. |
//! | `OREN_POLL_INTERVAL_MS` | `1000` | Advance and claim poll interval. |
//! | `OREN_EPOCH_LENGTH` | `7200` | Blocks per claim epoch. |
//! | `OREN_CYCLE_INCREMENT` | `10000000` | Cycles per machine run slice. |
//! | `OREN_MAX_CYCLES` | `1000000000` | Cycle ceiling per request. |
//! | `OREN_INSPECT_CONCURRENCY` | `8` | Concurrent inspect permits. |
//! | `OREN_INSPECT_ADDRESS` | `0.0.0.0:8080` | Inspect listener. |
//! | `OREN_TELEMETRY_ADDRESS` | `0.0.0.0:8081` | Probe listener. |
//! | `OREN_LOG_LEVEL` | `info` | `debug`, `info`, `warn` or `error`. |
//!
//! Claim-signing identity comes from `OREN_AUTH_MNEMONIC` (+
//! `OREN_AUTH_ACCOUNT_INDEX`), `OREN_AUTH_PRIVATE_KEY`, or
//! `OREN_AUTH_AWS_KMS_KEY_ID` + `OREN_AUTH_AWS_KMS_REGION`, preferred in
//! that order. Secret material never appears in `Debug` output or logs.

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::Level;
use uuid::Uuid;

use oren_machine::{CycleBudget, DEFAULT_INSPECT_CONCURRENCY};
use oren_services::DEFAULT_TELEMETRY_ADDRESS;

// ════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{name} is not set")]
    Missing { name: &'static str },

    #[error("{name} has invalid value `{value}`: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

// ════════════════════════════════════════════════════════════════════════════
// AUTH CONFIG
// ════════════════════════════════════════════════════════════════════════════

/// Identity used to sign claim submissions.
///
/// The variants are closed; there is no pluggable signer interface.
/// `Debug` redacts secret material so the config can be logged whole.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthConfig {
    Mnemonic {
        mnemonic: String,
        account_index: u32,
    },
    PrivateKey {
        hex: String,
    },
    Aws {
        key_id: String,
        region: String,
    },
}

impl AuthConfig {
    /// Resolves the signing identity from the environment.
    ///
    /// Precedence: mnemonic, then raw private key, then AWS KMS. Returns
    /// `Ok(None)` when no identity is configured; the node then records
    /// claims without submitting them.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        if let Ok(mnemonic) = env::var("OREN_AUTH_MNEMONIC") {
            let account_index = parse_var("OREN_AUTH_ACCOUNT_INDEX", 0u32)?;
            return Ok(Some(Self::Mnemonic {
                mnemonic,
                account_index,
            }));
        }
        if let Ok(key) = env::var("OREN_AUTH_PRIVATE_KEY") {
            let trimmed = key.trim_start_matches("0x").to_string();
            if hex::decode(&trimmed).is_err() || trimmed.len() != 64 {
                return Err(ConfigError::Invalid {
                    name: "OREN_AUTH_PRIVATE_KEY",
                    value: "<redacted>".to_string(),
                    reason: "expected 32 bytes of hex".to_string(),
                });
            }
            return Ok(Some(Self::PrivateKey { hex: trimmed }));
        }
        if let Ok(key_id) = env::var("OREN_AUTH_AWS_KMS_KEY_ID") {
            let region = env::var("OREN_AUTH_AWS_KMS_REGION").map_err(|_| {
                ConfigError::Missing {
                    name: "OREN_AUTH_AWS_KMS_REGION",
                }
            })?;
            return Ok(Some(Self::Aws { key_id, region }));
        }
        Ok(None)
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mnemonic { account_index, .. } => f
                .debug_struct("Mnemonic")
                .field("mnemonic", &"<redacted>")
                .field("account_index", account_index)
                .finish(),
            Self::PrivateKey { .. } => f
                .debug_struct("PrivateKey")
                .field("hex", &"<redacted>")
                .finish(),
            Self::Aws { region, .. } => f
                .debug_struct("Aws")
                .field("key_id", &"<redacted>")
                .field("region", region)
                .finish(),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// NODE CONFIG
// ════════════════════════════════════════════════════════════════════════════

/// Everything the node needs to come up, validated before use.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node identifier for logs; `auto` was expanded to a UUID already.
    pub node_id: String,
    /// Application whose inbox this node drains.
    pub app: String,
    /// Machine manager endpoint, or `mock` for the in-process emulator.
    pub machine_endpoint: String,
    /// Snapshot directory loaded at startup (remote mode).
    pub snapshot_path: Option<PathBuf>,
    /// Manager binary to spawn under the supervisor, if the node owns it.
    pub machine_manager_bin: Option<PathBuf>,
    pub machine_manager_args: Vec<String>,
    /// Manager readiness port; zero means scan stderr for the announcement.
    pub manager_healthcheck_port: u16,
    pub manager_bypass_log: bool,
    pub poll_interval: Duration,
    pub epoch_length: u64,
    pub cycle_increment: u64,
    pub max_cycles: u64,
    pub inspect_concurrency: usize,
    pub inspect_address: SocketAddr,
    pub telemetry_address: SocketAddr,
    pub log_level: String,
    pub auth: Option<AuthConfig>,
}

impl NodeConfig {
    /// Reads the full configuration from `OREN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id = match env::var("OREN_NODE_ID") {
            Ok(id) if id != "auto" => id,
            _ => Uuid::new_v4().to_string(),
        };

        let telemetry_default = DEFAULT_TELEMETRY_ADDRESS
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8081)));

        Ok(Self {
            node_id,
            app: var_or("OREN_APP", "dapp"),
            machine_endpoint: var_or("OREN_MACHINE_ENDPOINT", "mock"),
            snapshot_path: env::var("OREN_SNAPSHOT_PATH").ok().map(PathBuf::from),
            machine_manager_bin: env::var("OREN_MACHINE_MANAGER_BIN").ok().map(PathBuf::from),
            machine_manager_args: env::var("OREN_MACHINE_MANAGER_ARGS")
                .map(|args| args.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            manager_healthcheck_port: parse_var("OREN_MANAGER_HEALTHCHECK_PORT", 0u16)?,
            manager_bypass_log: parse_var("OREN_MANAGER_BYPASS_LOG", false)?,
            poll_interval: Duration::from_millis(parse_var("OREN_POLL_INTERVAL_MS", 1000u64)?),
            epoch_length: parse_var("OREN_EPOCH_LENGTH", oren_common::claim::DEFAULT_EPOCH_LENGTH)?,
            cycle_increment: parse_var(
                "OREN_CYCLE_INCREMENT",
                oren_machine::DEFAULT_CYCLE_INCREMENT,
            )?,
            max_cycles: parse_var("OREN_MAX_CYCLES", oren_machine::DEFAULT_MAX_CYCLES_PER_REQUEST)?,
            inspect_concurrency: parse_var("OREN_INSPECT_CONCURRENCY", DEFAULT_INSPECT_CONCURRENCY)?,
            inspect_address: parse_var(
                "OREN_INSPECT_ADDRESS",
                SocketAddr::from(([0, 0, 0, 0], 8080)),
            )?,
            telemetry_address: parse_var("OREN_TELEMETRY_ADDRESS", telemetry_default)?,
            log_level: var_or("OREN_LOG_LEVEL", "info"),
            auth: AuthConfig::from_env()?,
        })
    }

    /// Whether the node runs against the in-process emulator.
    pub fn is_mock(&self) -> bool {
        self.machine_endpoint == "mock"
    }

    pub fn cycle_budget(&self) -> CycleBudget {
        CycleBudget {
            increment: self.cycle_increment,
            max: self.max_cycles,
        }
    }

    pub fn tracing_level(&self) -> Level {
        match self.log_level.as_str() {
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }

    /// Rejects configurations that cannot run before any service starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(invalid("OREN_NODE_ID", "", "must not be empty"));
        }
        if self.app.is_empty() {
            return Err(invalid("OREN_APP", "", "must not be empty"));
        }
        if !matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(invalid(
                "OREN_LOG_LEVEL",
                &self.log_level,
                "expected debug, info, warn or error",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("OREN_POLL_INTERVAL_MS", "0", "must be positive"));
        }
        if self.epoch_length == 0 {
            return Err(invalid("OREN_EPOCH_LENGTH", "0", "must be positive"));
        }
        if self.cycle_increment == 0 {
            return Err(invalid("OREN_CYCLE_INCREMENT", "0", "must be positive"));
        }
        if self.max_cycles < self.cycle_increment {
            return Err(invalid(
                "OREN_MAX_CYCLES",
                &self.max_cycles.to_string(),
                "must be at least the cycle increment",
            ));
        }
        if self.inspect_concurrency == 0 {
            return Err(invalid("OREN_INSPECT_CONCURRENCY", "0", "must be positive"));
        }
        if !self.is_mock() && self.snapshot_path.is_none() {
            return Err(ConfigError::Missing {
                name: "OREN_SNAPSHOT_PATH",
            });
        }
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HELPERS
// ════════════════════════════════════════════════════════════════════════════

fn var_or(name: &'static str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            value: value.clone(),
            reason: format!("cannot parse as {}", std::any::type_name::<T>()),
        }),
        Err(_) => Ok(default),
    }
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
