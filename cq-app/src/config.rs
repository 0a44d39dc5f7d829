//! convoqueue configuration loader.
//!
//! Integer millisecond/second fields in TOML, converted into the core's
//! `Duration`-based configs at the edge.

use cq_core::{BufferConfig, RecoveryConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConvoQueueConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub buffer: BufferSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub downstream: DownstreamConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local maps; state is lost on restart.
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database file shared by every worker. Default: `~/.convoqueue/queue.db`
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferSection {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_age_seconds")]
    pub max_batch_age_seconds: u64,
    #[serde(default = "default_max_gap_seconds")]
    pub max_gap_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_lock_ttl_seconds")]
    pub lock_ttl_seconds: u64,
    /// Defaults to twice the debounce window.
    #[serde(default)]
    pub reactivation_window_ms: Option<u64>,
    #[serde(default = "default_entry_ttl_seconds")]
    pub entry_ttl_seconds: u64,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_batch_size: default_max_batch_size(),
            max_batch_age_seconds: default_max_batch_age_seconds(),
            max_gap_seconds: default_max_gap_seconds(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            lock_ttl_seconds: default_lock_ttl_seconds(),
            reactivation_window_ms: None,
            entry_ttl_seconds: default_entry_ttl_seconds(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    5_000
}

fn default_max_batch_size() -> usize {
    5
}

fn default_max_batch_age_seconds() -> u64 {
    60
}

fn default_max_gap_seconds() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    2_000
}

fn default_retry_max_ms() -> u64 {
    60_000
}

fn default_lock_ttl_seconds() -> u64 {
    30
}

fn default_entry_ttl_seconds() -> u64 {
    24 * 60 * 60
}

impl BufferSection {
    fn reactivation_window_ms(&self) -> u64 {
        self.reactivation_window_ms
            .unwrap_or_else(|| self.debounce_ms.saturating_mul(2))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_stuck_seconds")]
    pub stuck_processing_seconds: u64,
    #[serde(default = "default_stuck_seconds")]
    pub stuck_lock_seconds: u64,
    /// Defaults to the buffer's reactivation window.
    #[serde(default)]
    pub cooldown_retention_ms: Option<u64>,
    #[serde(default = "default_emergency_threshold_seconds")]
    pub emergency_threshold_seconds: u64,
    #[serde(default = "default_recent_events_capacity")]
    pub recent_events_capacity: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: default_sweep_interval_seconds(),
            stuck_processing_seconds: default_stuck_seconds(),
            stuck_lock_seconds: default_stuck_seconds(),
            cooldown_retention_ms: None,
            emergency_threshold_seconds: default_emergency_threshold_seconds(),
            recent_events_capacity: default_recent_events_capacity(),
        }
    }
}

fn default_sweep_interval_seconds() -> u64 {
    30
}

fn default_stuck_seconds() -> u64 {
    120
}

fn default_emergency_threshold_seconds() -> u64 {
    30 * 60
}

fn default_recent_events_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamConfig {
    /// Endpoint receiving each combined batch as JSON.
    #[serde(default)]
    pub process_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_downstream_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            process_url: String::new(),
            auth_token: None,
            timeout_seconds: default_downstream_timeout_seconds(),
        }
    }
}

fn default_downstream_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    /// In-process timers owned by this worker.
    #[default]
    Timer,
    /// Follow-ups handed to an external timer service that later calls flush-check.
    Webhook,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub mode: SchedulerMode,
    #[serde(default)]
    pub follow_up_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_scheduler_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::default(),
            follow_up_url: None,
            auth_token: None,
            timeout_seconds: default_scheduler_timeout_seconds(),
        }
    }
}

fn default_scheduler_timeout_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// When set, admin routes require `Authorization: Bearer <admin_token>`.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl ConvoQueueConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    /// Reads the config file. A missing file at the default location yields defaults;
    /// an explicitly named file must exist.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(config_path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub(crate) fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = var("CONVOQUEUE_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = var("CONVOQUEUE_SQLITE_PATH") {
            self.storage.sqlite_path = Some(v);
            self.storage.backend = StorageBackend::Sqlite;
        }
        if let Some(v) = var("CONVOQUEUE_DOWNSTREAM_URL") {
            self.downstream.process_url = v;
        }
        if let Some(v) = var("CONVOQUEUE_ADMIN_TOKEN") {
            self.security.admin_token = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.downstream.process_url.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "downstream.process_url is required (or set CONVOQUEUE_DOWNSTREAM_URL)"
            ));
        }
        if self.downstream.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("downstream.timeout_seconds must be > 0"));
        }
        if self.scheduler.mode == SchedulerMode::Webhook {
            let missing = self
                .scheduler
                .follow_up_url
                .as_deref()
                .is_none_or(|url| url.trim().is_empty());
            if missing {
                return Err(anyhow::anyhow!(
                    "scheduler.follow_up_url is required when scheduler.mode = \"webhook\""
                ));
            }
        }
        self.buffer_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("[buffer] {e}"))?;
        self.recovery_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("[recovery] {e}"))?;
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("server.bind_addr {:?}: {e}", self.server.bind_addr))
    }

    pub fn sqlite_path(&self) -> anyhow::Result<PathBuf> {
        match self.storage.sqlite_path.as_deref() {
            Some(path) => expand_home(path),
            None => Ok(default_root_dir().join("queue.db")),
        }
    }

    pub fn buffer_config(&self) -> BufferConfig {
        let b = &self.buffer;
        BufferConfig {
            debounce_window: Duration::from_millis(b.debounce_ms),
            max_batch_size: b.max_batch_size,
            max_batch_age: Duration::from_secs(b.max_batch_age_seconds),
            max_time_between_messages: Duration::from_secs(b.max_gap_seconds),
            max_attempts: b.max_attempts,
            retry_base_delay: Duration::from_millis(b.retry_base_ms),
            retry_max_delay: Duration::from_millis(b.retry_max_ms),
            lock_ttl: Duration::from_secs(b.lock_ttl_seconds),
            reactivation_window: Duration::from_millis(b.reactivation_window_ms()),
            entry_ttl: Duration::from_secs(b.entry_ttl_seconds),
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        let r = &self.recovery;
        RecoveryConfig {
            sweep_interval: Duration::from_secs(r.sweep_interval_seconds),
            stuck_processing_threshold: Duration::from_secs(r.stuck_processing_seconds),
            stuck_lock_threshold: Duration::from_secs(r.stuck_lock_seconds),
            cooldown_retention: Duration::from_millis(
                r.cooldown_retention_ms
                    .unwrap_or_else(|| self.buffer.reactivation_window_ms()),
            ),
            emergency_threshold: Duration::from_secs(r.emergency_threshold_seconds),
            recent_events_capacity: r.recent_events_capacity,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    default_root_dir().join("config.toml")
}

fn default_root_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".convoqueue")
}

fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}
