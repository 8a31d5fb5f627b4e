//! Engine and store configuration
//!
//! Both configs can be built in code or read from the environment:
//!
//! - `FLOWGATE_REJECT_POLICY`: `reopen_previous_stage` (default), `restart_flow` or `flag_only`
//! - `FLOWGATE_CLAIM_TTL_SECS`: how long a resolution claim blocks other approvers (default: 300)
//! - `DATABASE_URL`: Postgres connection string; unset selects the in-memory store
//! - `FLOWGATE_DB_MAX_CONNECTIONS`: pool size (default: 10)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration parsing errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// What a rejection does to the rest of the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectPolicy {
    /// Reset every step of the previous stage to pending
    #[default]
    ReopenPreviousStage,

    /// Reset every other step, sending the instance back to stage 0
    RestartFlow,

    /// Only record the rejection
    FlagOnly,
}

impl RejectPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReopenPreviousStage => "reopen_previous_stage",
            Self::RestartFlow => "restart_flow",
            Self::FlagOnly => "flag_only",
        }
    }
}

impl std::fmt::Display for RejectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RejectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "reopen_previous_stage" | "reopen" => Ok(Self::ReopenPreviousStage),
            "restart_flow" | "restart" => Ok(Self::RestartFlow),
            "flag_only" | "flag" => Ok(Self::FlagOnly),
            _ => Err(format!(
                "unknown reject policy {s:?}, use reopen_previous_stage, restart_flow or flag_only"
            )),
        }
    }
}

/// Behaviour knobs shared by every instance of a flow definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub reject_policy: RejectPolicy,

    /// Age after which an unfinished resolution claim may be taken over
    #[serde(with = "duration_millis")]
    pub claim_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reject_policy: RejectPolicy::default(),
            claim_ttl: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reject_policy(mut self, policy: RejectPolicy) -> Self {
        self.reject_policy = policy;
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("FLOWGATE_REJECT_POLICY") {
            config.reject_policy = value.parse().map_err(|reason| ConfigError::InvalidValue {
                var: "FLOWGATE_REJECT_POLICY",
                value: value.clone(),
                reason,
            })?;
        }

        if let Some(value) = lookup("FLOWGATE_CLAIM_TTL_SECS") {
            let secs = value
                .trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::InvalidValue {
                    var: "FLOWGATE_CLAIM_TTL_SECS",
                    value: value.clone(),
                    reason: e.to_string(),
                })?;
            config.claim_ttl = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

/// Where ledgers are kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Postgres connection string; `None` selects the in-memory store
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
        }
    }
}

impl StoreConfig {
    /// Create configuration from environment variables
    ///
    /// Loads a `.env` file first when one is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            ..Self::default()
        };

        if let Some(value) = lookup("FLOWGATE_DB_MAX_CONNECTIONS") {
            config.max_connections = value.trim().parse::<u32>().map_err(|e| {
                ConfigError::InvalidValue {
                    var: "FLOWGATE_DB_MAX_CONNECTIONS",
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(config)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
