//! Engine configuration
//!
//! Defaults come from `ESCALATION_*` environment variables. A TOML file can
//! override any subset of fields; missing fields keep their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::escalation::AllFailedPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Tunables for the escalation coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// What to do when every method of an attempt fails
    pub all_failed_policy: AllFailedPolicy,
    /// Fail in-flight instances whose chain gets disabled
    pub fail_on_disabled_chain: bool,
    /// Upper bound on a single `Dispatcher::send`
    pub dispatch_timeout_secs: u64,
    /// Terminal instances kept for lookup and late results
    pub archive_capacity: usize,
    /// How often stalled waits are re-armed
    pub watchdog_interval_secs: u64,
    /// Broadcast buffer size of the event bus
    pub event_capacity: usize,
    /// Events kept by the in-memory history
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            all_failed_policy: match std::env::var("ESCALATION_ALL_FAILED_POLICY").as_deref() {
                Ok("short_circuit") => AllFailedPolicy::ShortCircuit,
                _ => AllFailedPolicy::WaitFullDuration,
            },
            fail_on_disabled_chain: std::env::var("ESCALATION_FAIL_ON_DISABLED_CHAIN")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            dispatch_timeout_secs: env_parse("ESCALATION_DISPATCH_TIMEOUT_SECS").unwrap_or(30),
            archive_capacity: env_parse("ESCALATION_ARCHIVE_CAPACITY").unwrap_or(1024),
            watchdog_interval_secs: env_parse("ESCALATION_WATCHDOG_INTERVAL_SECS").unwrap_or(30),
            event_capacity: env_parse("ESCALATION_EVENT_CAPACITY").unwrap_or(256),
            history_capacity: env_parse("ESCALATION_HISTORY_CAPACITY").unwrap_or(10_000),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn with_all_failed_policy(mut self, policy: AllFailedPolicy) -> Self {
        self.all_failed_policy = policy;
        self
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs.max(1))
    }

    /// `None` disables the watchdog
    pub fn watchdog_interval(&self) -> Option<Duration> {
        (self.watchdog_interval_secs > 0).then(|| Duration::from_secs(self.watchdog_interval_secs))
    }
}
