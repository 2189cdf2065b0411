//! Orchestrator configuration.
//!
//! Layered: [`Config::default`], then an optional JSON file, then
//! environment overrides.
//!
//! ```rust,ignore
//! use duelnet::Config;
//!
//! let config = Config::from_file("duelnet.json")?.apply_env()?;
//! config.validate()?;
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{DuelError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub battle: BattleConfig,
    pub queue: QueueConfig,
    pub judge: JudgeConfig,
    pub limits: LimitsConfig,
    pub persistence: PersistenceConfig,
    pub telemetry: TelemetryConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Close sockets that send nothing (not even a ping) for this long.
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            idle_timeout_secs: 60,
        }
    }
}

/// Battle lifecycle timing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BattleConfig {
    pub time_limit_secs: u64,
    /// Countdown between `battle_found` and IN_PROGRESS.
    pub start_delay_ms: u64,
    pub reconnect_grace_secs: u64,
    /// How long a finished battle stays resolvable for late reconnects.
    pub post_battle_grace_secs: u64,
    /// Extra wait for in-flight judge calls before eviction.
    pub settle_timeout_secs: u64,
    /// Finish the battle as soon as either side is accepted.
    pub end_on_first_accept: bool,
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            time_limit_secs: 1800,
            start_delay_ms: 1000,
            reconnect_grace_secs: 30,
            post_battle_grace_secs: 60,
            settle_timeout_secs: 30,
            end_on_first_accept: false,
        }
    }
}

impl BattleConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }

    pub fn post_battle_grace(&self) -> Duration {
        Duration::from_secs(self.post_battle_grace_secs)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }
}

/// Matchmaking queue configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum time in queue before eviction (seconds).
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub status_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            poll_interval_ms: 1000,
            status_interval_secs: 5,
        }
    }
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

/// External judge service
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3001".to_string(),
            timeout_secs: 30,
        }
    }
}

impl JudgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-user request limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_code_len: usize,
    pub max_sledge_len: usize,
    pub sledge_cooldown_secs: u64,
    pub runs_per_minute: u32,
    pub submits_per_minute: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_code_len: 50_000,
            max_sledge_len: 100,
            sledge_cooldown_secs: 60,
            runs_per_minute: 60,
            submits_per_minute: 30,
        }
    }
}

/// Background persistence worker
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub max_attempts: u32,
    /// First retry delay; doubled after every failed attempt.
    pub backoff_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 2000,
        }
    }
}

impl PersistenceConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Log output
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub json: bool,
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
            otlp_endpoint: None,
        }
    }
}

impl Config {
    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| DuelError::config(format!("{}: {}", path.display(), e)))
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_vars<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(port) = lookup("PORT") {
            let port: u16 = parse_var("PORT", &port)?;
            let host = self
                .server
                .bind_addr
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.bind_addr = format!("{}:{}", host, port);
        }
        if let Some(url) = lookup("JUDGE_URL") {
            self.judge.url = url;
        }
        if let Some(v) = lookup("JUDGE_TIMEOUT") {
            self.judge.timeout_secs = parse_var("JUDGE_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("BATTLE_TIME_LIMIT") {
            self.battle.time_limit_secs = parse_var("BATTLE_TIME_LIMIT", &v)?;
        }
        if let Some(v) = lookup("BATTLE_QUEUE_TIMEOUT") {
            self.queue.timeout_secs = parse_var("BATTLE_QUEUE_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("RECONNECT_GRACE") {
            self.battle.reconnect_grace_secs = parse_var("RECONNECT_GRACE", &v)?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.telemetry.log_level = level;
        }
        if let Some(v) = lookup("LOG_JSON") {
            self.telemetry.json = parse_var("LOG_JSON", &v)?;
        }
        Ok(self)
    }

    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.battle.time_limit_secs == 0 {
            return Err(DuelError::config("battle.time_limit_secs must be positive"));
        }
        if self.battle.reconnect_grace_secs == 0 {
            return Err(DuelError::config("battle.reconnect_grace_secs must be positive"));
        }
        if self.queue.timeout_secs == 0 || self.queue.poll_interval_ms == 0 {
            return Err(DuelError::config("queue timeout and poll interval must be positive"));
        }
        if self.queue.status_interval_secs == 0 {
            return Err(DuelError::config("queue.status_interval_secs must be positive"));
        }
        if self.judge.timeout_secs == 0 {
            return Err(DuelError::config("judge.timeout_secs must be positive"));
        }
        if self.limits.max_code_len == 0 || self.limits.max_sledge_len == 0 {
            return Err(DuelError::config("length limits must be positive"));
        }
        if self.limits.runs_per_minute == 0 || self.limits.submits_per_minute == 0 {
            return Err(DuelError::config("rate limits must be positive"));
        }
        if self.persistence.max_attempts == 0 {
            return Err(DuelError::config("persistence.max_attempts must be positive"));
        }
        Ok(())
    }

    pub fn with_time_limit(mut self, secs: u64) -> Self {
        self.battle.time_limit_secs = secs;
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.battle.start_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_reconnect_grace(mut self, secs: u64) -> Self {
        self.battle.reconnect_grace_secs = secs;
        self
    }

    pub fn with_queue_timeout(mut self, secs: u64) -> Self {
        self.queue.timeout_secs = secs;
        self
    }

    pub fn with_judge_timeout(mut self, secs: u64) -> Self {
        self.judge.timeout_secs = secs;
        self
    }

    pub fn with_end_on_first_accept(mut self, enabled: bool) -> Self {
        self.battle.end_on_first_accept = enabled;
        self
    }

    pub fn with_sledge_cooldown(mut self, secs: u64) -> Self {
        self.limits.sledge_cooldown_secs = secs;
        self
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DuelError::config(format!("invalid value for {}: {:?}", key, value)))
}
