//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{EscrowError, Result};
use crate::lifecycle::{LifecycleSettings, DEFAULT_AUTOMATION_ACTOR};
use crate::state_machine::{self, CampaignState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    pub db_max_connections: u32,
    /// Whether this process runs the deadline worker
    pub lifecycle_enabled: bool,
    pub lifecycle_interval_secs: u64,
    /// Age after which a processing lease is considered abandoned
    pub lease_timeout_secs: u64,
    pub lifecycle_batch_size: i64,
    /// Actor recorded on automated transitions and refunds
    pub automation_actor: String,
    /// State a funded campaign moves to right after `SUCCESS`
    pub success_successor: CampaignState,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_source<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let success_successor: CampaignState = var("SUCCESS_SUCCESSOR", "PROCUREMENT")
            .parse()
            .map_err(|_| EscrowError::Config("Invalid SUCCESS_SUCCESSOR".to_string()))?;
        if !state_machine::is_legal(CampaignState::Success, success_successor)
            || success_successor == CampaignState::Failed
        {
            return Err(EscrowError::Config(format!(
                "SUCCESS_SUCCESSOR must be PROCUREMENT or FULFILLMENT, got {success_successor}"
            )));
        }

        let log_format = match var("LOG_FORMAT", "text").to_ascii_lowercase().as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => return Err(EscrowError::Config(format!("Invalid LOG_FORMAT: {other}"))),
        };

        let automation_actor = var("AUTOMATION_ACTOR", DEFAULT_AUTOMATION_ACTOR);
        if automation_actor.trim().is_empty() {
            return Err(EscrowError::Config("AUTOMATION_ACTOR cannot be empty".to_string()));
        }

        let config = Config {
            database_url: var("DATABASE_URL", "sqlite:./escrow.db"),
            api_port: parse(&var("API_PORT", "3001"), "API_PORT")?,
            db_max_connections: parse(&var("DB_MAX_CONNECTIONS", "5"), "DB_MAX_CONNECTIONS")?,
            lifecycle_enabled: parse_bool(&var("LIFECYCLE_ENABLED", "true"), "LIFECYCLE_ENABLED")?,
            lifecycle_interval_secs: parse(
                &var("LIFECYCLE_INTERVAL_SECS", "120"),
                "LIFECYCLE_INTERVAL_SECS",
            )?,
            lease_timeout_secs: parse(&var("LEASE_TIMEOUT_SECS", "300"), "LEASE_TIMEOUT_SECS")?,
            lifecycle_batch_size: parse(&var("LIFECYCLE_BATCH_SIZE", "100"), "LIFECYCLE_BATCH_SIZE")?,
            automation_actor,
            success_successor,
            log_format,
        };

        if config.db_max_connections == 0 {
            return Err(EscrowError::Config("DB_MAX_CONNECTIONS must be at least 1".to_string()));
        }
        if config.lifecycle_interval_secs == 0 || config.lease_timeout_secs == 0 {
            return Err(EscrowError::Config(
                "LIFECYCLE_INTERVAL_SECS and LEASE_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        if config.lifecycle_batch_size <= 0 {
            return Err(EscrowError::Config("LIFECYCLE_BATCH_SIZE must be positive".to_string()));
        }
        Ok(config)
    }

    pub fn lifecycle(&self) -> LifecycleSettings {
        LifecycleSettings {
            interval: Duration::from_secs(self.lifecycle_interval_secs),
            lease_timeout: Duration::from_secs(self.lease_timeout_secs),
            batch_size: self.lifecycle_batch_size,
            actor: self.automation_actor.clone(),
            success_successor: self.success_successor,
        }
    }
}

fn parse<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| EscrowError::Config(format!("Invalid {key}")))
}

fn parse_bool(raw: &str, key: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EscrowError::Config(format!("Invalid {key}"))),
    }
}
