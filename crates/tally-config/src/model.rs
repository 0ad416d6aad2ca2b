// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the Tally service.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use tally_core::TallyError;

/// Top-level Tally configuration.
///
/// Loaded from TOML files following the XDG hierarchy, with environment
/// variable overrides. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TallyConfig {
    /// Service identity and logging.
    #[serde(default)]
    pub service: ServiceConfig,

    /// SQLite storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Balance defaults and conflict handling.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Notification backend selection.
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Scheduled dispatcher cadence and retry policy.
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Service identity and logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Name reported in logs.
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Logging level (trace, debug, info, warn, error). `RUST_LOG` wins if set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_service_name() -> String {
    "tally".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Enable WAL (Write-Ahead Logging) mode so the request path and the
    /// scheduler can share the file.
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,

    /// How long a writer waits on another process's lock before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            wal_mode: default_wal_mode(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|p| p.join("tally").join("tally.db"))
        .unwrap_or_else(|| std::path::PathBuf::from("tally.db"))
        .to_string_lossy()
        .into_owned()
}

fn default_wal_mode() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Balance defaults applied when a (user, provider) pair is first seen.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// Currency code for newly created balances.
    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Warning threshold for newly created balances, as a decimal string.
    /// Bare TOML or env numbers are accepted too.
    #[serde(default = "default_threshold", deserialize_with = "decimal_text")]
    pub default_threshold: String,

    /// Extra attempts made when a balance update hits a locked database.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_currency: default_currency(),
            default_threshold: default_threshold(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

impl LedgerConfig {
    /// Parses `default_threshold` into a decimal.
    pub fn threshold(&self) -> Result<BigDecimal, TallyError> {
        BigDecimal::from_str(self.default_threshold.trim()).map_err(|e| {
            TallyError::Config(format!(
                "ledger.default_threshold `{}` is not a decimal: {e}",
                self.default_threshold
            ))
        })
    }
}

/// Accepts `"5.00"`, `5` or `5.5` and keeps the value as text.
fn decimal_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DecimalInput {
        Text(String),
        Integer(i64),
        Float(f64),
    }

    Ok(match DecimalInput::deserialize(deserializer)? {
        DecimalInput::Text(text) => text,
        DecimalInput::Integer(value) => value.to_string(),
        DecimalInput::Float(value) => value.to_string(),
    })
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_threshold() -> String {
    "5.00".to_string()
}

fn default_max_conflict_retries() -> u32 {
    3
}

/// Which delivery backend receives low-balance notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyBackend {
    /// Emit a structured log line.
    Log,
    /// POST a JSON payload to `notify.webhook_url`.
    Webhook,
}

/// Notification configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyConfig {
    /// When false, threshold crossings are tracked but nothing is enqueued.
    #[serde(default = "default_notify_enabled")]
    pub enabled: bool,

    /// Delivery backend.
    #[serde(default = "default_backend")]
    pub backend: NotifyBackend,

    /// Target URL for the webhook backend.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// HTTP timeout for webhook delivery.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: default_notify_enabled(),
            backend: default_backend(),
            webhook_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_notify_enabled() -> bool {
    true
}

fn default_backend() -> NotifyBackend {
    NotifyBackend::Log
}

fn default_timeout_secs() -> u64 {
    10
}

/// Scheduled dispatcher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    /// Seconds between scheduled dispatch runs.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Maximum notifications claimed per run.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Delivery attempts before a notification is dropped as failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lease on a claimed notification; expired leases are reclaimed.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_batch_size() -> u32 {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_lock_timeout_secs() -> u64 {
    300
}
