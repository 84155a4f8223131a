//! Configuration system for Gatekeeper.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GATEKEEPER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/gatekeeper/config.toml
//!   3. ~/.config/gatekeeper/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::crypto::DEFAULT_KEY_BITS;

/// Default read size for both relay directions.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default delay between bind attempts.
pub const DEFAULT_BIND_RETRY_SECS: u64 = 5;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatekeeperConfig {
    pub listen: ListenConfig,
    pub relay: RelayConfig,
    pub handshake: HandshakeConfig,
    pub mappings: MappingsConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Address to bind.
    pub addr: String,
    /// Port to bind. 0 = OS-assigned.
    pub port: u16,
    /// Listen backlog.
    pub backlog: u32,
    /// Delay between bind attempts while the address is unavailable.
    pub bind_retry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Max bytes per read/write on the client socket.
    pub client_chunk_size: usize,
    /// Max bytes per read/write on the endpoint socket.
    pub endpoint_chunk_size: usize,
    /// Attach the keyword intercept filter to every session.
    pub intercept_keywords: bool,
    /// Keywords that end a session when intercept is enabled.
    pub keywords: Vec<String>,
    /// Attach the carriage-return stripping filter to every session.
    pub strip_carriage_returns: bool,
    /// Endpoint connect timeout. 0 = no timeout.
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// RSA modulus size of the per-process key pair.
    pub key_bits: usize,
    /// Upper bound on the whole handshake. 0 = no timeout.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingsConfig {
    /// Mapping file (`sha256sum = addr:port` per line).
    pub path: PathBuf,
}

/// Timings for the reaper and the shutdown escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Delay before the reaper's first sweep.
    pub reaper_grace_ms: u64,
    /// Delay between reaper sweeps.
    pub reaper_interval_ms: u64,
    /// Per-unit join timeout used by liveness checks.
    pub join_timeout_ms: u64,
    /// Fixed part of the bounded wait for the reaper while draining.
    pub drain_base_ms: u64,
    /// Wait after asking sessions to terminate.
    pub terminate_grace_ms: u64,
    /// Extra wait before stragglers are killed.
    pub kill_grace_ms: u64,
    /// Delay after the last kill before returning.
    pub final_delay_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0".to_string(),
            port: 7700,
            backlog: 64,
            bind_retry_secs: DEFAULT_BIND_RETRY_SECS,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            client_chunk_size: DEFAULT_CHUNK_SIZE,
            endpoint_chunk_size: DEFAULT_CHUNK_SIZE,
            intercept_keywords: false,
            keywords: vec!["quit".to_string(), "exit".to_string()],
            strip_carriage_returns: false,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            key_bits: DEFAULT_KEY_BITS,
            timeout_secs: 30,
        }
    }
}

impl Default for MappingsConfig {
    fn default() -> Self {
        Self {
            path: config_dir().join("mappings"),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            reaper_grace_ms: 2_000,
            reaper_interval_ms: 2_000,
            join_timeout_ms: 100,
            drain_base_ms: 3_000,
            terminate_grace_ms: 1_500,
            kill_grace_ms: 1_000,
            final_delay_ms: 100,
        }
    }
}

// ── Duration helpers ──────────────────────────────────────────────────────────

impl ListenConfig {
    pub fn bind_retry(&self) -> Duration {
        Duration::from_secs(self.bind_retry_secs)
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.connect_timeout_secs)
    }
}

impl HandshakeConfig {
    pub fn timeout(&self) -> Option<Duration> {
        non_zero_secs(self.timeout_secs)
    }
}

impl ShutdownConfig {
    pub fn reaper_grace(&self) -> Duration {
        Duration::from_millis(self.reaper_grace_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Bounded wait for the reaper: a fixed base plus one join per tracked unit.
    pub fn drain_budget(&self, tracked: usize) -> Duration {
        Duration::from_millis(self.drain_base_ms) + self.join_timeout() * tracked as u32
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn final_delay(&self) -> Duration {
        Duration::from_millis(self.final_delay_ms)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("gatekeeper")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl GatekeeperConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            GatekeeperConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a config document. Missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GATEKEEPER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&GatekeeperConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply GATEKEEPER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides looked up by `GATEKEEPER_<SECTION>__<KEY>` name.
    /// Values that do not parse are ignored.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let listen = &mut self.listen;
        if let Some(v) = var("GATEKEEPER_LISTEN__ADDR") {
            listen.addr = v;
        }
        set_parsed(&mut listen.port, var("GATEKEEPER_LISTEN__PORT"));
        set_parsed(&mut listen.backlog, var("GATEKEEPER_LISTEN__BACKLOG"));
        set_parsed(&mut listen.bind_retry_secs, var("GATEKEEPER_LISTEN__BIND_RETRY_SECS"));

        let relay = &mut self.relay;
        set_parsed(&mut relay.client_chunk_size, var("GATEKEEPER_RELAY__CLIENT_CHUNK_SIZE"));
        set_parsed(&mut relay.endpoint_chunk_size, var("GATEKEEPER_RELAY__ENDPOINT_CHUNK_SIZE"));
        set_flag(&mut relay.intercept_keywords, var("GATEKEEPER_RELAY__INTERCEPT_KEYWORDS"));
        set_flag(&mut relay.strip_carriage_returns, var("GATEKEEPER_RELAY__STRIP_CARRIAGE_RETURNS"));
        set_parsed(&mut relay.connect_timeout_secs, var("GATEKEEPER_RELAY__CONNECT_TIMEOUT_SECS"));
        // Comma separated: GATEKEEPER_RELAY__KEYWORDS=quit,exit,bye
        if let Some(v) = var("GATEKEEPER_RELAY__KEYWORDS") {
            relay.keywords = v
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
        }

        set_parsed(&mut self.handshake.key_bits, var("GATEKEEPER_HANDSHAKE__KEY_BITS"));
        set_parsed(&mut self.handshake.timeout_secs, var("GATEKEEPER_HANDSHAKE__TIMEOUT_SECS"));

        if let Some(v) = var("GATEKEEPER_MAPPINGS__PATH") {
            self.mappings.path = PathBuf::from(v);
        }

        let shutdown = &mut self.shutdown;
        set_parsed(&mut shutdown.reaper_grace_ms, var("GATEKEEPER_SHUTDOWN__REAPER_GRACE_MS"));
        set_parsed(&mut shutdown.reaper_interval_ms, var("GATEKEEPER_SHUTDOWN__REAPER_INTERVAL_MS"));
        set_parsed(&mut shutdown.join_timeout_ms, var("GATEKEEPER_SHUTDOWN__JOIN_TIMEOUT_MS"));
        set_parsed(&mut shutdown.drain_base_ms, var("GATEKEEPER_SHUTDOWN__DRAIN_BASE_MS"));
        set_parsed(&mut shutdown.terminate_grace_ms, var("GATEKEEPER_SHUTDOWN__TERMINATE_GRACE_MS"));
        set_parsed(&mut shutdown.kill_grace_ms, var("GATEKEEPER_SHUTDOWN__KILL_GRACE_MS"));
        set_parsed(&mut shutdown.final_delay_ms, var("GATEKEEPER_SHUTDOWN__FINAL_DELAY_MS"));

        self.sanitize();
    }

    /// Replace zero chunk sizes and a zero bind retry delay with the defaults.
    pub fn sanitize(&mut self) {
        if self.relay.client_chunk_size == 0 {
            self.relay.client_chunk_size = DEFAULT_CHUNK_SIZE;
        }
        if self.relay.endpoint_chunk_size == 0 {
            self.relay.endpoint_chunk_size = DEFAULT_CHUNK_SIZE;
        }
        if self.listen.bind_retry_secs == 0 {
            self.listen.bind_retry_secs = DEFAULT_BIND_RETRY_SECS;
        }
    }
}

fn set_parsed<T: std::str::FromStr>(field: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
        *field = parsed;
    }
}

fn set_flag(field: &mut bool, value: Option<String>) {
    if let Some(v) = value {
        *field = v == "true" || v == "1";
    }
}
