//! Runtime configuration.
//!
//! Configuration is passed as JSON via the `JOBWIRE_CONFIG` environment
//! variable. Every field has a default, so an unset variable or an empty
//! object yields a working configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::transport::DEFAULT_MAX_FRAME_SIZE;

/// Environment variable holding the JSON configuration.
pub const CONFIG_ENV: &str = "JOBWIRE_CONFIG";

/// Top-level configuration shared by agents and clients.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Per-connection settings.
    #[serde(default)]
    pub conn: ConnConfig,

    /// Accept loop settings.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Agent lifecycle settings.
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Settings applied to every connection, on both ends.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnConfig {
    /// Timeout for establishing an outbound TCP connection.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,

    /// Timeout for completing a TLS handshake.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Capacity of the job-side log queue before producers wait.
    #[serde(default = "default_log_buffer")]
    pub log_buffer: usize,

    /// Largest frame accepted or sent.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Accept loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Upper bound for a single accept call; also the shutdown check tick.
    #[serde(default = "default_accept_deadline")]
    pub accept_deadline_ms: u64,

    /// TCP keep-alive idle time for accepted connections.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

/// Agent lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// How long shutdown waits for in-flight connections.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            log_buffer: default_log_buffer(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl ConnConfig {
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            accept_deadline_ms: default_accept_deadline(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl ListenerConfig {
    pub const fn accept_deadline(&self) -> Duration {
        Duration::from_millis(self.accept_deadline_ms)
    }

    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl AgentConfig {
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Config {
    /// Load configuration from `JOBWIRE_CONFIG`, falling back to defaults
    /// when the variable is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::from_json(&json)
                .with_context(|| format!("Failed to parse {CONFIG_ENV}")),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {CONFIG_ENV}")),
        }
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.listener.accept_deadline_ms > 0,
            "listener.accept_deadline_ms must be positive"
        );
        anyhow::ensure!(self.conn.log_buffer > 0, "conn.log_buffer must be positive");
        anyhow::ensure!(
            self.conn.max_frame_size > 0,
            "conn.max_frame_size must be positive"
        );
        Ok(())
    }
}

const fn default_dial_timeout() -> u64 {
    10_000
}

const fn default_handshake_timeout() -> u64 {
    10_000
}

const fn default_log_buffer() -> usize {
    64
}

const fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

const fn default_accept_deadline() -> u64 {
    1_000
}

const fn default_keep_alive() -> u64 {
    180
}

const fn default_shutdown_grace() -> u64 {
    5_000
}
