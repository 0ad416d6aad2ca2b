// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-deserialization validation for configuration values.
//!
//! Checks constraints serde cannot express: decimal thresholds, currency
//! codes, non-zero cadences, and backend-specific required keys.

use bigdecimal::Zero;

use crate::diagnostic::ConfigError;
use crate::model::{NotifyBackend, TallyConfig};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validate a deserialized configuration for semantic correctness.
///
/// Collects every failure instead of stopping at the first one.
pub fn validate_config(config: &TallyConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let mut invalid = |message: String| errors.push(ConfigError::Validation { message });

    if !LOG_LEVELS.contains(&config.service.log_level.to_lowercase().as_str()) {
        invalid(format!(
            "service.log_level `{}` must be one of {}",
            config.service.log_level,
            LOG_LEVELS.join(", ")
        ));
    }

    if config.storage.database_path.trim().is_empty() {
        invalid("storage.database_path must not be empty".to_string());
    }

    let currency = &config.ledger.default_currency;
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
        invalid(format!(
            "ledger.default_currency `{currency}` must be a three-letter uppercase ISO code"
        ));
    }

    match config.ledger.threshold() {
        Ok(threshold) if threshold < bigdecimal::BigDecimal::zero() => invalid(format!(
            "ledger.default_threshold must be non-negative, got {threshold}"
        )),
        Ok(_) => {}
        Err(e) => invalid(e.to_string()),
    }

    if config.notify.backend == NotifyBackend::Webhook {
        match config.notify.webhook_url.as_deref().map(str::trim) {
            None | Some("") => {
                invalid("notify.webhook_url is required when notify.backend = \"webhook\"".to_string())
            }
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => invalid(
                format!("notify.webhook_url `{url}` must start with http:// or https://"),
            ),
            Some(_) => {}
        }
    }

    if config.notify.timeout_secs == 0 {
        invalid("notify.timeout_secs must be at least 1".to_string());
    }

    if config.dispatch.interval_secs == 0 {
        invalid("dispatch.interval_secs must be at least 1".to_string());
    }

    if config.dispatch.batch_size == 0 {
        invalid("dispatch.batch_size must be at least 1".to_string());
    }

    if config.dispatch.max_attempts == 0 {
        invalid("dispatch.max_attempts must be at least 1".to_string());
    }

    if config.dispatch.lock_timeout_secs <= config.notify.timeout_secs {
        invalid(format!(
            "dispatch.lock_timeout_secs ({}) must be greater than notify.timeout_secs ({})",
            config.dispatch.lock_timeout_secs, config.notify.timeout_secs
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
