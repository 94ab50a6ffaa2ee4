//! Configuration loading from TOML with environment variable overrides.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section falls back to defaults, so a partial file (or none at all in
//! tests) still yields a usable configuration.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::engine::queue::QueueConfig;
use crate::types::BettingTerms;

/// Overrides `storage.database_url` when set.
pub const DATABASE_URL_ENV: &str = "WAGERHALL_DATABASE_URL";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub betting: BettingConfig,
    pub queue: QueueSection,
    pub session: SessionConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Chat channel that receives event announcements.
    pub announce_target: String,
    /// Actors granted every operator capability.
    pub operators: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "wagerhall".into(),
            announce_target: "betting-hall".into(),
            operators: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://wagerhall.db".into(),
            max_connections: 4,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Global betting defaults, copied into each event at creation.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BettingConfig {
    pub min_bet: i64,
    pub max_bet: i64,
    pub limit_per_user: u32,
    pub fee_percent: Decimal,
    /// Bets at or above this amount are flagged for review.
    pub suspicious_amount: i64,
    pub payout_expiry_days: i64,
}

impl Default for BettingConfig {
    fn default() -> Self {
        Self {
            min_bet: 10,
            max_bet: 10_000,
            limit_per_user: 3,
            fee_percent: dec!(5),
            suspicious_amount: 5_000,
            payout_expiry_days: 7,
        }
    }
}

impl BettingConfig {
    pub fn terms(&self) -> BettingTerms {
        BettingTerms {
            min_bet: self.min_bet,
            max_bet: self.max_bet,
            limit_per_user: self.limit_per_user,
            fee_percent: self.fee_percent,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSection {
    pub base_spacing_ms: u64,
    pub min_spacing_ms: u64,
    pub max_spacing_ms: u64,
    pub stall_after_secs: u64,
    pub stall_failure_threshold: u32,
    pub backlog_threshold: usize,
    /// Re-enqueue attempts for a failed announcement.
    pub announce_retries: u32,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            base_spacing_ms: 500,
            min_spacing_ms: 100,
            max_spacing_ms: 10_000,
            stall_after_secs: 30,
            stall_failure_threshold: 5,
            backlog_threshold: 10,
            announce_retries: 1,
        }
    }
}

impl QueueSection {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            base_spacing: Duration::from_millis(self.base_spacing_ms),
            min_spacing: Duration::from_millis(self.min_spacing_ms),
            max_spacing: Duration::from_millis(self.max_spacing_ms),
            stall_after: Duration::from_secs(self.stall_after_secs),
            stall_failure_threshold: self.stall_failure_threshold,
            backlog_threshold: self.backlog_threshold,
            ..QueueConfig::default()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_secs: 900, capacity: 256 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self { enabled: true, port: 8088 }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.finish()
    }

    /// Like [`AppConfig::load`], but a missing file means built-in
    /// defaults. A file that exists and fails to load is still an error.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            return Self::load(path);
        }
        warn!(path, "Config file not found, running with defaults");
        Self::default().finish()
    }

    /// Apply environment overrides and validate.
    fn finish(mut self) -> Result<Self> {
        if let Ok(url) = Self::resolve_env(DATABASE_URL_ENV) {
            self.storage.database_url = url;
        }
        self.validate()?;
        Ok(self)
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.betting
            .terms()
            .validate()
            .context("Invalid [betting] defaults")?;
        if self.betting.suspicious_amount <= 0 {
            anyhow::bail!("[betting] suspicious_amount must be positive");
        }
        if self.queue.min_spacing_ms > self.queue.base_spacing_ms
            || self.queue.base_spacing_ms > self.queue.max_spacing_ms
        {
            anyhow::bail!("[queue] spacing must satisfy min <= base <= max");
        }
        if self.session.capacity == 0 {
            anyhow::bail!("[session] capacity must be at least 1");
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
