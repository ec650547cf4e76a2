//! Configuration model and hierarchical loader.
//!
//! Precedence (lowest to highest): programmatic defaults, project config
//! (`.claw/config.yaml`), local overrides (`.claw/local.yaml`), and
//! `CLAW_*` environment variables with `__` nesting.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::{EngineConfig, LoopRunnerConfig, PlanExecutorConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid workers: {0}. Must be between 1 and 64")]
    InvalidWorkers(usize),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid max_attempts: {0}. Cannot be 0")]
    InvalidMaxAttempts(u32),

    #[error("Invalid heartbeat/lease ratio: heartbeat {0}s must be shorter than lease ttl {1}s")]
    InvalidLeaseRatio(u64, u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ".claw/claw.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub lease_ttl_secs: u64,
    pub heartbeat_secs: u64,
    pub task_timeout_secs: u64,
    pub max_attempts: u32,
    pub max_queue_depth: u64,
    pub aging_threshold_secs: u64,
    pub aging_increment: i64,
    pub policy_version: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 500,
            lease_ttl_secs: 60,
            heartbeat_secs: 10,
            task_timeout_secs: 600,
            max_attempts: 3,
            max_queue_depth: 0,
            aging_threshold_secs: 60,
            aging_increment: 1,
            policy_version: "v1".to_string(),
        }
    }
}

impl EngineSettings {
    /// Engine config for one pool scope.
    pub fn to_engine_config(&self, agent_id: Option<String>) -> EngineConfig {
        EngineConfig {
            agent_id,
            workers: self.workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            max_attempts: self.max_attempts,
            max_queue_depth: self.max_queue_depth,
            aging_threshold: Duration::from_secs(self.aging_threshold_secs),
            aging_increment: self.aging_increment,
            policy_version: self.policy_version.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanSettings {
    pub step_timeout_secs: u64,
    pub approval_timeout_secs: u64,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            step_timeout_secs: 300,
            approval_timeout_secs: 120,
        }
    }
}

impl PlanSettings {
    pub fn to_executor_config(&self) -> PlanExecutorConfig {
        PlanExecutorConfig {
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            approval_timeout: Duration::from_secs(self.approval_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSettings {
    pub max_steps: u32,
    pub max_tokens: u64,
    pub max_duration_secs: u64,
    pub checkpoint_interval: u32,
    pub termination_keyword: String,
}

impl Default for LoopSettings {
    fn default() -> Self {
        let defaults = LoopRunnerConfig::default();
        Self {
            max_steps: defaults.max_steps,
            max_tokens: defaults.max_tokens,
            max_duration_secs: defaults.max_duration.as_secs(),
            checkpoint_interval: defaults.checkpoint_interval,
            termination_keyword: defaults.termination_keyword,
        }
    }
}

impl LoopSettings {
    pub fn to_runner_config(&self) -> LoopRunnerConfig {
        LoopRunnerConfig {
            max_steps: self.max_steps,
            max_tokens: self.max_tokens,
            max_duration: Duration::from_secs(self.max_duration_secs),
            checkpoint_interval: self.checkpoint_interval,
            termination_keyword: self.termination_keyword.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub engine: EngineSettings,
    pub scheduler: SchedulerSettings,
    pub plan: PlanSettings,
    pub loops: LoopSettings,
    pub logging: LoggingConfig,
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".claw/config.yaml"))
            .merge(Yaml::file(".claw/local.yaml"))
            .merge(Env::prefixed("CLAW_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.engine.workers == 0 || config.engine.workers > 64 {
            return Err(ConfigError::InvalidWorkers(config.engine.workers));
        }
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.engine.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(config.engine.max_attempts));
        }
        if config.engine.heartbeat_secs >= config.engine.lease_ttl_secs {
            return Err(ConfigError::InvalidLeaseRatio(
                config.engine.heartbeat_secs,
                config.engine.lease_ttl_secs,
            ));
        }
        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
        match config.logging.format.as_str() {
            "json" | "pretty" => {}
            other => return Err(ConfigError::InvalidLogFormat(other.to_string())),
        }
        Ok(())
    }
}
