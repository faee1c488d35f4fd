//! ⚙️ Engine knobs. Every one of them has a default, because nobody reads config docs
//! until something is on fire.
//!
//! Durations are plain milliseconds in config files (`linger_ms = 1000`) and come out
//! as [`Duration`]s through the accessor methods.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

/// 🛡️ How many replicas must accept a write before the server calls it done.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyLevel {
    One,
    #[default]
    Quorum,
    All,
}

/// 🎛️ Who decides how big a batch is.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchMode {
    /// 🤖 The admission controller listens to the server's queue statistics.
    #[default]
    Dynamic,
    /// 📏 You know best. Probably.
    FixedSize { batch_size: usize, concurrency: usize },
    /// 🐢 At most this many records per rolling minute.
    RateLimit { requests_per_minute: usize },
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BatchConfig {
    #[serde(default)]
    pub mode: BatchMode,
    #[serde(default)]
    pub consistency_level: ConsistencyLevel,
    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// 📏 Encoded size budget for one `Data` message.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_admission_interval_ms")]
    pub admission_interval_ms: u64,
    #[serde(default = "default_concurrency_cooldown_ms")]
    pub concurrency_cooldown_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_oom_timeout_ms")]
    pub oom_timeout_ms: u64,
    /// 🔄 Rate-limit retries per record before it lands in the failure map.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u64,
    #[serde(default = "default_max_result_history")]
    pub max_result_history: usize,
    /// 🤐 Failed result messages logged in detail before we switch to aggregates.
    #[serde(default = "default_error_log_cap")]
    pub error_log_cap: usize,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// 🕵️ Extra `provider -> [regex]` rate-limit patterns, merged over the built-in table.
    #[serde(default)]
    pub retryable_errors: BTreeMap<String, Vec<String>>,
}

fn default_initial_batch_size() -> usize {
    100
}
fn default_max_batch_size() -> usize {
    1000
}
fn default_min_concurrency() -> usize {
    1
}
fn default_max_concurrency() -> usize {
    4
}
fn default_max_message_bytes() -> usize {
    // -- 10 MiB, comfortably under the usual 16 MiB server-side ceiling
    10 * 1024 * 1024
}
fn default_linger_ms() -> u64 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_admission_interval_ms() -> u64 {
    1000
}
fn default_concurrency_cooldown_ms() -> u64 {
    10_000
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_oom_timeout_ms() -> u64 {
    600_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_rate_limit_cooldown_ms() -> u64 {
    1000
}
fn default_max_result_history() -> usize {
    100_000
}
fn default_error_log_cap() -> usize {
    30
}
fn default_close_timeout_ms() -> u64 {
    30_000
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            mode: BatchMode::default(),
            consistency_level: ConsistencyLevel::default(),
            initial_batch_size: default_initial_batch_size(),
            max_batch_size: default_max_batch_size(),
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            max_message_bytes: default_max_message_bytes(),
            linger_ms: default_linger_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            admission_interval_ms: default_admission_interval_ms(),
            concurrency_cooldown_ms: default_concurrency_cooldown_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            oom_timeout_ms: default_oom_timeout_ms(),
            max_retries: default_max_retries(),
            rate_limit_cooldown_ms: default_rate_limit_cooldown_ms(),
            max_result_history: default_max_result_history(),
            error_log_cap: default_error_log_cap(),
            close_timeout_ms: default_close_timeout_ms(),
            retryable_errors: BTreeMap::new(),
        }
    }
}

impl BatchConfig {
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
    pub fn admission_interval(&self) -> Duration {
        Duration::from_millis(self.admission_interval_ms.max(1))
    }
    pub fn concurrency_cooldown(&self) -> Duration {
        Duration::from_millis(self.concurrency_cooldown_ms)
    }
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
    pub fn oom_timeout(&self) -> Duration {
        Duration::from_millis(self.oom_timeout_ms)
    }
    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// 🔝 Concurrency ceiling for the current mode. Fixed mode may ask for more than
    /// `max_concurrency`; we let it, it signed the waiver.
    pub fn stream_ceiling(&self) -> usize {
        match &self.mode {
            BatchMode::FixedSize { concurrency, .. } => (*concurrency).max(1),
            BatchMode::RateLimit { .. } => 1,
            BatchMode::Dynamic => self.max_concurrency.max(self.min_concurrency).max(1),
        }
    }
}

/// ⏳ How patiently we wait for the vector index to catch up after a flush.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReadinessConfig {
    /// 🚦 Only the CLI looks at this. Library callers just call the method.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_readiness_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_readiness_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_readiness_log_interval_ms")]
    pub log_interval_ms: u64,
    #[serde(default = "default_readiness_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_readiness_max_retries() -> u32 {
    5
}
fn default_readiness_poll_interval_ms() -> u64 {
    250
}
fn default_readiness_log_interval_ms() -> u64 {
    5000
}
fn default_readiness_backoff_base_ms() -> u64 {
    1000
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: default_readiness_max_retries(),
            poll_interval_ms: default_readiness_poll_interval_ms(),
            log_interval_ms: default_readiness_log_interval_ms(),
            backoff_base_ms: default_readiness_backoff_base_ms(),
        }
    }
}

impl ReadinessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_interval_ms)
    }
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}
