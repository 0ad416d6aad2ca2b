// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Domain types shared across the storage, accounting and dispatch crates.

use std::fmt;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Identifier of the user a usage event or balance belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// External AI vendor whose usage and spend is tracked.
///
/// Stored in the database and accepted on the command line as the
/// lowercase name (`openai`, `anthropic`, `google`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Anthropic,
    Google,
}

impl Provider {
    /// Every supported provider, in display order.
    pub const ALL: [Provider; 3] = [Provider::OpenAI, Provider::Anthropic, Provider::Google];
}

/// One external API call, as persisted in `usage_records`.
///
/// Records are append-only: they are never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Unique record identifier (UUID v4).
    pub id: String,
    pub user_id: UserId,
    pub provider: Provider,
    /// Model identifier reported by the provider (e.g. "gpt-4o").
    pub model_name: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Always `prompt_tokens + completion_tokens`.
    pub total_tokens: u64,
    /// Estimated cost in the balance currency.
    pub cost: BigDecimal,
    /// ISO 8601 UTC timestamp.
    pub created_at: String,
    /// Originating background task, if the call was made on behalf of one.
    pub related_task_id: Option<String>,
}

/// Running balance for one (user, provider) pair.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub id: i64,
    pub user_id: UserId,
    pub provider: Provider,
    pub balance: BigDecimal,
    /// ISO 4217 currency code.
    pub currency: String,
    pub warning_threshold: BigDecimal,
    /// Whether the low-balance warning has fired and not yet re-armed.
    pub threshold_crossed: bool,
    /// Optional provider API key stored alongside the balance.
    #[serde(skip_serializing)]
    pub credential: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Balance {
    /// Whether the balance is at or below its warning threshold.
    pub fn is_below_threshold(&self) -> bool {
        self.balance <= self.warning_threshold
    }
}

impl fmt::Debug for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Balance")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("balance", &self.balance)
            .field("currency", &self.currency)
            .field("warning_threshold", &self.warning_threshold)
            .field("threshold_crossed", &self.threshold_crossed)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Payload handed to a [`NotificationSink`](crate::NotificationSink) when a
/// balance crosses its warning threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowBalanceNotice {
    pub notification_id: i64,
    pub user_id: UserId,
    pub provider: Provider,
    pub balance: BigDecimal,
    pub threshold: BigDecimal,
    pub currency: String,
    /// When the crossing was detected.
    pub created_at: String,
}

impl LowBalanceNotice {
    /// One-line human readable summary, used by log and text sinks.
    pub fn summary(&self) -> String {
        format!(
            "{} balance for user {} is {} {} (warning threshold {} {})",
            self.provider, self.user_id, self.balance, self.currency, self.threshold, self.currency
        )
    }
}
