use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const TIMEOUT_ENV: &str = "MICRO_LEDGER_TIMEOUT_MS";
pub const OVERDRAFT_ENV: &str = "MICRO_LEDGER_ALLOW_OVERDRAFT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got `{value}`")]
    InvalidValue {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound for one operation, from `begin` to `commit`.
    pub operation_timeout_ms: u64,
    /// When set, reversing or shrinking a transfer may drive the recipient
    /// below zero instead of failing with insufficient funds.
    pub allow_reversal_overdraft: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 5_000,
            allow_reversal_overdraft: false,
        }
    }
}

impl EngineConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Defaults, overridden by whichever of the environment variables are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = lookup(TIMEOUT_ENV) {
            config.operation_timeout_ms = match value.trim().parse() {
                Ok(ms) if ms > 0 => ms,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: TIMEOUT_ENV,
                        expected: "a positive number of milliseconds",
                        value,
                    });
                }
            };
        }
        if let Some(value) = lookup(OVERDRAFT_ENV) {
            config.allow_reversal_overdraft = match value.trim() {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: OVERDRAFT_ENV,
                        expected: "true or false",
                        value,
                    });
                }
            };
        }
        Ok(config)
    }
}
