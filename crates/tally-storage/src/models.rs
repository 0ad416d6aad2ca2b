// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage-side entity types and row decoding helpers.
//!
//! The domain types (`UsageRecord`, `Balance`) live in `tally-core`; this
//! module adds the notification queue entry, reporting aggregates and the
//! conversions between SQLite text columns and decimals/providers.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use rusqlite::Row;
use rusqlite::types::Type;
use serde::Serialize;
use strum::{Display, EnumString};
use tally_core::{LowBalanceNotice, Provider, UserId};

/// Values applied to a balance row the first time a pair is seen.
#[derive(Debug, Clone)]
pub struct BalanceDefaults {
    pub currency: String,
    pub threshold: BigDecimal,
}

impl Default for BalanceDefaults {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            threshold: BigDecimal::new(500.into(), 2),
        }
    }
}

/// A usage event ready to be inserted. `total_tokens` is derived on insert.
#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub id: String,
    pub user_id: UserId,
    pub provider: Provider,
    pub model_name: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost: BigDecimal,
    pub related_task_id: Option<String>,
}

/// Delivery state of a queued notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

/// A row of the `notifications` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEntry {
    pub id: i64,
    pub user_id: UserId,
    pub provider: Provider,
    pub balance: BigDecimal,
    pub threshold: BigDecimal,
    pub currency: String,
    pub status: NotificationStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub locked_until: Option<String>,
    pub sent_at: Option<String>,
}

impl NotificationEntry {
    /// The payload handed to a notification sink.
    pub fn to_notice(&self) -> LowBalanceNotice {
        LowBalanceNotice {
            notification_id: self.id,
            user_id: self.user_id.clone(),
            provider: self.provider,
            balance: self.balance.clone(),
            threshold: self.threshold.clone(),
            currency: self.currency.clone(),
            created_at: self.created_at.clone(),
        }
    }
}

/// Usage totals for one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderUsage {
    pub provider: Provider,
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: BigDecimal,
}

impl ProviderUsage {
    fn empty(provider: Provider) -> Self {
        Self {
            provider,
            calls: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cost: BigDecimal::from(0),
        }
    }
}

/// Usage totals for one user, broken down by provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub user_id: UserId,
    pub providers: Vec<ProviderUsage>,
}

impl UsageSummary {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            providers: Vec::new(),
        }
    }

    /// Fold one usage row into the per-provider totals.
    pub fn add(
        &mut self,
        provider: Provider,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost: &BigDecimal,
    ) {
        let idx = match self.providers.iter().position(|p| p.provider == provider) {
            Some(idx) => idx,
            None => {
                self.providers.push(ProviderUsage::empty(provider));
                self.providers.len() - 1
            }
        };
        let entry = &mut self.providers[idx];
        entry.calls += 1;
        entry.prompt_tokens += prompt_tokens;
        entry.completion_tokens += completion_tokens;
        entry.total_tokens += prompt_tokens + completion_tokens;
        entry.cost += cost;
    }

    pub fn total_calls(&self) -> u64 {
        self.providers.iter().map(|p| p.calls).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.providers.iter().map(|p| p.total_tokens).sum()
    }

    pub fn total_cost(&self) -> BigDecimal {
        self.providers
            .iter()
            .fold(BigDecimal::from(0), |acc, p| acc + &p.cost)
    }
}

/// Read a decimal stored as TEXT.
pub fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<BigDecimal> {
    let text: String = row.get(idx)?;
    BigDecimal::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a provider stored as lowercase TEXT.
pub fn provider_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Provider> {
    let text: String = row.get(idx)?;
    Provider::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a notification status stored as lowercase TEXT.
pub fn status_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<NotificationStatus> {
    let text: String = row.get(idx)?;
    NotificationStatus::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a non-negative INTEGER column as `u64`.
pub fn count_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}
