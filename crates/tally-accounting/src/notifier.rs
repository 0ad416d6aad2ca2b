// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Edge-triggered low-balance notification.
//!
//! A balance fires a warning the first time it is at or below its threshold.
//! The `threshold_crossed` flag then suppresses further warnings until the
//! balance is strictly above the threshold again, which re-arms it.

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tally_config::model::{DispatchConfig, NotifyConfig};
use tally_core::{Balance, Provider, TallyError, UserId};
use tally_storage::Database;
use tally_storage::database::map_tr_err;
use tally_storage::queries::{balances, notifications};
use tracing::{debug, warn};

/// How a balance's notification state should move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdTransition {
    /// At or below the threshold and not yet warned: fire.
    Crossed,
    /// Strictly above the threshold while marked crossed: re-arm.
    Rearmed,
    Unchanged,
}

/// Result of a threshold check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationOutcome {
    None,
    /// A notification row was enqueued.
    Warned { notification_id: i64 },
}

impl NotificationOutcome {
    pub fn is_warned(&self) -> bool {
        matches!(self, NotificationOutcome::Warned { .. })
    }
}

/// Pure transition policy for one balance.
pub fn evaluate(balance: &Balance) -> ThresholdTransition {
    match (balance.is_below_threshold(), balance.threshold_crossed) {
        (true, false) => ThresholdTransition::Crossed,
        (false, true) => ThresholdTransition::Rearmed,
        _ => ThresholdTransition::Unchanged,
    }
}

/// Applies the threshold policy and enqueues notifications.
#[derive(Debug, Clone)]
pub struct ThresholdNotifier {
    enabled: bool,
    max_attempts: u32,
}

impl Default for ThresholdNotifier {
    fn default() -> Self {
        Self::new(true, 3)
    }
}

impl ThresholdNotifier {
    /// `enabled = false` keeps tracking the crossed flag but never enqueues.
    pub fn new(enabled: bool, max_attempts: u32) -> Self {
        Self {
            enabled,
            max_attempts,
        }
    }

    pub fn from_config(notify: &NotifyConfig, dispatch: &DispatchConfig) -> Self {
        Self::new(notify.enabled, dispatch.max_attempts)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check `balance` on an open transaction and persist any flag change.
    ///
    /// Returns the balance as stored afterwards together with the outcome.
    pub fn check_in_tx(
        &self,
        conn: &Connection,
        balance: Balance,
    ) -> rusqlite::Result<(Balance, NotificationOutcome)> {
        match evaluate(&balance) {
            ThresholdTransition::Unchanged => Ok((balance, NotificationOutcome::None)),
            ThresholdTransition::Rearmed => {
                let balance = balances::save_state(
                    conn,
                    balance.id,
                    &balance.balance,
                    &balance.warning_threshold,
                    false,
                )?;
                debug!(
                    user_id = %balance.user_id,
                    provider = %balance.provider,
                    balance = %balance.balance,
                    "low-balance warning re-armed"
                );
                Ok((balance, NotificationOutcome::None))
            }
            ThresholdTransition::Crossed => {
                let balance = balances::save_state(
                    conn,
                    balance.id,
                    &balance.balance,
                    &balance.warning_threshold,
                    true,
                )?;
                if !self.enabled {
                    debug!(
                        user_id = %balance.user_id,
                        provider = %balance.provider,
                        "threshold crossed, notifications disabled"
                    );
                    return Ok((balance, NotificationOutcome::None));
                }

                let notification_id = notifications::enqueue(conn, &balance, self.max_attempts)?;
                warn!(
                    user_id = %balance.user_id,
                    provider = %balance.provider,
                    balance = %balance.balance,
                    threshold = %balance.warning_threshold,
                    currency = %balance.currency,
                    notification_id,
                    "balance crossed warning threshold"
                );
                Ok((balance, NotificationOutcome::Warned { notification_id }))
            }
        }
    }

    /// Check the stored balance of a pair in its own transaction.
    ///
    /// Returns `NotFound` when the pair has no balance row.
    pub async fn check(
        &self,
        db: &Database,
        user_id: &UserId,
        provider: Provider,
    ) -> Result<(Balance, NotificationOutcome), TallyError> {
        let notifier = self.clone();
        let user = user_id.clone();
        let result = db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let checked = match balances::find(&tx, &user, provider)? {
                    Some(balance) => Some(notifier.check_in_tx(&tx, balance)?),
                    None => None,
                };
                tx.commit()?;
                Ok(checked)
            })
            .await
            .map_err(map_tr_err)?;

        result.ok_or_else(|| TallyError::NotFound(format!("balance for {user_id}/{provider}")))
    }
}
