//! Miner configuration module.
//!
//! Loads settings from `miner.toml` with environment variable overrides.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this priority order (highest wins):
//! 1. Environment variables (e.g., `MINER_DATA_DIR`, `CHAIN_GATEWAY_URL`)
//! 2. TOML file (`miner.toml` by default)
//! 3. Built-in defaults
//!
//! # Sections
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `node` | Data directory, keypair, idle space target |
//! | `chain` | Chain gateway URL and TLS settings |
//! | `tee` | Preferred TEE endpoints |
//! | `pois` | Idle file shape and accumulator parameters |
//! | `timing` | Sleeps, backoffs and TEE timeout ladders |
//!
//! # Example
//!
//! ```toml
//! [node]
//! data_dir = "data/miner"
//! use_space_gib = 2000
//!
//! [chain]
//! gateway_url = "https://gateway.example:8443"
//!
//! [tee]
//! priority_endpoints = ["tee-a.example:8080"]
//!
//! [timing.commit_verify]
//! base_secs = 600
//! step_secs = 180
//! max_secs = 1320
//! attempts = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use pois::{AccKey, PoisParams};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::retry::TimeoutLadder;

/// Read an env var, parse it, and apply it to `target`. Logs a warning on parse failure.
fn env_parse<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = std::env::var(var) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env = var,
                value = %val,
                expected_type = std::any::type_name::<T>(),
                "Invalid env var value, using default"
            ),
        }
    }
}

/// Read an env var as a string and set an `Option<String>` field.
fn env_string_opt(var: &str, target: &mut Option<String>) {
    if let Ok(val) = std::env::var(var) {
        *target = Some(val);
    }
}

/// Read a comma separated env var into a list, skipping empty items.
fn env_list(var: &str, target: &mut Vec<String>) {
    if let Ok(val) = std::env::var(var) {
        *target = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MinerConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub tee: TeeConfig,
    #[serde(default)]
    pub pois: PoisConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Root of the miner workspace (fragments, idle files, proof records)
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Keypair file; defaults to `<data_dir>/keypair.bin`
    pub keypair_path: Option<String>,

    /// Idle space the miner fills and certifies, in GiB
    #[serde(default = "default_use_space_gib")]
    pub use_space_gib: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            keypair_path: None,
            use_space_gib: default_use_space_gib(),
        }
    }
}

impl NodeConfig {
    pub fn keypair_path(&self) -> PathBuf {
        match &self.keypair_path {
            Some(path) => PathBuf::from(path),
            None => Path::new(&self.data_dir).join("keypair.bin"),
        }
    }
}

fn default_data_dir() -> String {
    "data/miner".to_string()
}
fn default_use_space_gib() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Skip TLS certificate verification (dev only)
    #[serde(default)]
    pub insecure_tls: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            insecure_tls: false,
        }
    }
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:9944".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TeeConfig {
    /// Endpoints tried first for commit, deletion and tag requests
    #[serde(default)]
    pub priority_endpoints: Vec<String>,

    /// Scheme prepended to endpoints registered without one
    #[serde(default = "default_endpoint_scheme")]
    pub endpoint_scheme: String,
}

impl Default for TeeConfig {
    fn default() -> Self {
        Self {
            priority_endpoints: Vec::new(),
            endpoint_scheme: default_endpoint_scheme(),
        }
    }
}

fn default_endpoint_scheme() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoisConfig {
    #[serde(default = "default_elems_num")]
    pub elems_num: i64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_file_chunks")]
    pub chunks: usize,

    /// Accumulator modulus, hex. Only needed before the first certification;
    /// afterwards the chain's registered key is used.
    pub acc_modulus_hex: Option<String>,
    pub acc_generator_hex: Option<String>,
}

impl Default for PoisConfig {
    fn default() -> Self {
        Self {
            elems_num: default_elems_num(),
            chunk_size: default_chunk_size(),
            chunks: default_file_chunks(),
            acc_modulus_hex: None,
            acc_generator_hex: None,
        }
    }
}

impl PoisConfig {
    pub fn params(&self) -> PoisParams {
        PoisParams {
            elems_num: self.elems_num,
            chunk_size: self.chunk_size,
            chunks: self.chunks,
        }
    }

    /// Accumulator key from the configured hex parameters.
    pub fn acc_key(&self) -> Result<AccKey> {
        let (Some(n), Some(g)) = (&self.acc_modulus_hex, &self.acc_generator_hex) else {
            anyhow::bail!("accumulator key not registered on chain and not configured");
        };
        let n = hex::decode(n.trim_start_matches("0x"))?;
        let g = hex::decode(g.trim_start_matches("0x"))?;
        Ok(AccKey::from_bytes(&n, &g)?)
    }
}

fn default_elems_num() -> i64 {
    pois::DEFAULT_ELEMS_NUM
}
fn default_chunk_size() -> usize {
    pois::DEFAULT_CHUNK_SIZE
}
fn default_file_chunks() -> usize {
    pois::DEFAULT_FILE_CHUNKS
}

/// Sleeps, backoffs and timeout ladders
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    #[serde(default = "default_block_interval")]
    pub block_interval_secs: u64,
    /// Sleep before retrying a busy TEE
    #[serde(default = "default_busy_sleep")]
    pub busy_sleep_secs: u64,
    /// Relaunch delay of a worker that had nothing to do
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Relaunch delay after the prover reported busy
    #[serde(default = "default_busy_backoff")]
    pub busy_backoff_secs: u64,
    /// Relaunch delay after a failed cycle
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    /// Blocks to wait after a proof submission before asking which TEE verifies it
    #[serde(default = "default_allocation_wait_blocks")]
    pub allocation_wait_blocks: u32,
    /// Rounds over the priority endpoints before falling back to every marker TEE
    #[serde(default = "default_priority_rounds")]
    pub priority_rounds: u32,
    #[serde(default = "default_chain_submit_attempts")]
    pub chain_submit_attempts: u32,

    #[serde(default = "default_commit_challenge")]
    pub commit_challenge: TimeoutLadder,
    #[serde(default = "default_commit_verify")]
    pub commit_verify: TimeoutLadder,
    #[serde(default = "default_deletion_verify")]
    pub deletion_verify: TimeoutLadder,
    #[serde(default = "default_space_verify")]
    pub space_single_verify: TimeoutLadder,
    #[serde(default = "default_space_verify")]
    pub space_total_verify: TimeoutLadder,
    #[serde(default = "default_batch_verify")]
    pub batch_verify: TimeoutLadder,
    #[serde(default = "default_gen_tag")]
    pub gen_tag: TimeoutLadder,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            block_interval_secs: default_block_interval(),
            busy_sleep_secs: default_busy_sleep(),
            poll_interval_secs: default_poll_interval(),
            busy_backoff_secs: default_busy_backoff(),
            error_backoff_secs: default_error_backoff(),
            allocation_wait_blocks: default_allocation_wait_blocks(),
            priority_rounds: default_priority_rounds(),
            chain_submit_attempts: default_chain_submit_attempts(),
            commit_challenge: default_commit_challenge(),
            commit_verify: default_commit_verify(),
            deletion_verify: default_deletion_verify(),
            space_single_verify: default_space_verify(),
            space_total_verify: default_space_verify(),
            batch_verify: default_batch_verify(),
            gen_tag: default_gen_tag(),
        }
    }
}

impl TimingConfig {
    pub fn block_interval(&self) -> Duration {
        Duration::from_secs(self.block_interval_secs)
    }

    pub fn busy_sleep(&self) -> Duration {
        Duration::from_secs(self.busy_sleep_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn busy_backoff(&self) -> Duration {
        Duration::from_secs(self.busy_backoff_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

fn default_block_interval() -> u64 {
    common::BLOCK_INTERVAL_SECS
}
fn default_busy_sleep() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    60
}
fn default_busy_backoff() -> u64 {
    30
}
fn default_error_backoff() -> u64 {
    60
}
fn default_allocation_wait_blocks() -> u32 {
    2
}
fn default_priority_rounds() -> u32 {
    3
}
fn default_chain_submit_attempts() -> u32 {
    5
}
fn default_commit_challenge() -> TimeoutLadder {
    TimeoutLadder::new(180, 180, 540, 3)
}
fn default_commit_verify() -> TimeoutLadder {
    TimeoutLadder::new(600, 180, 1320, 5)
}
fn default_deletion_verify() -> TimeoutLadder {
    TimeoutLadder::new(180, 120, 360, 3)
}
fn default_space_verify() -> TimeoutLadder {
    TimeoutLadder::new(600, 600, 2400, 4)
}
fn default_batch_verify() -> TimeoutLadder {
    TimeoutLadder::new(600, 0, 600, 3)
}
fn default_gen_tag() -> TimeoutLadder {
    TimeoutLadder::new(300, 300, 900, 3)
}

impl MinerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = path.unwrap_or("miner.toml");

        let mut config = if Path::new(config_path).exists() {
            let content = std::fs::read_to_string(config_path)?;
            toml::from_str(&content)?
        } else {
            warn!(config_path = %config_path, "No config file found, using defaults/env vars");
            MinerConfig::default()
        };

        // Node overrides
        if let Ok(val) = std::env::var("MINER_DATA_DIR") {
            config.node.data_dir = val;
        }
        env_string_opt("MINER_KEYPAIR_PATH", &mut config.node.keypair_path);
        env_parse("MINER_USE_SPACE_GIB", &mut config.node.use_space_gib);

        // Chain overrides
        if let Ok(val) = std::env::var("CHAIN_GATEWAY_URL") {
            config.chain.gateway_url = val;
        }
        if let Ok(val) = std::env::var("CHAIN_INSECURE_TLS") {
            config.chain.insecure_tls = val == "1" || val.to_lowercase() == "true";
        }

        // TEE overrides
        env_list("TEE_PRIORITY_ENDPOINTS", &mut config.tee.priority_endpoints);

        // PoIS overrides
        env_string_opt("POIS_ACC_MODULUS", &mut config.pois.acc_modulus_hex);
        env_string_opt("POIS_ACC_GENERATOR", &mut config.pois.acc_generator_hex);

        // Timing overrides
        env_parse("MINER_POLL_INTERVAL_SECS", &mut config.timing.poll_interval_secs);
        env_parse("MINER_BUSY_SLEEP_SECS", &mut config.timing.busy_sleep_secs);
        env_parse(
            "MINER_ERROR_BACKOFF_SECS",
            &mut config.timing.error_backoff_secs,
        );

        Ok(config)
    }
}
