// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running balance per (user, provider).
//!
//! Every mutation is a read-modify-write inside one `BEGIN IMMEDIATE`
//! transaction, so writers in this process serialize on the connection
//! thread and writers in other processes serialize on the SQLite write
//! lock. The threshold check runs inside the same transaction.

use std::time::Duration;

use bigdecimal::{BigDecimal, Zero};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tally_config::TallyConfig;
use tally_core::{Balance, Provider, TallyError, UserId};
use tally_storage::database::{is_tr_lock_contention, map_tr_err};
use tally_storage::queries::balances;
use tally_storage::{BalanceDefaults, Database};
use tracing::{debug, info, warn};

use crate::notifier::{NotificationOutcome, ThresholdNotifier};

/// Base delay between attempts after a lock conflict; grows linearly.
const CONFLICT_BACKOFF: Duration = Duration::from_millis(25);

/// The balance after a mutation and what the threshold check did.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceChange {
    pub balance: Balance,
    pub notification: NotificationOutcome,
}

/// Defaults and notification policy shared by every balance mutation.
///
/// Cloned into connection-thread closures, so it holds no handles.
#[derive(Debug, Clone, Default)]
pub struct LedgerRules {
    pub defaults: BalanceDefaults,
    pub notifier: ThresholdNotifier,
}

impl LedgerRules {
    /// Add `delta` to the pair's balance and run the threshold check.
    ///
    /// Must be called on an open transaction; creates the row if needed.
    pub fn adjust_in_tx(
        &self,
        conn: &Connection,
        user_id: &UserId,
        provider: Provider,
        delta: &BigDecimal,
    ) -> rusqlite::Result<BalanceChange> {
        let current = balances::ensure(conn, user_id, provider, &self.defaults)?;
        let new_amount = &current.balance + delta;
        let updated = balances::save_state(
            conn,
            current.id,
            &new_amount,
            &current.warning_threshold,
            current.threshold_crossed,
        )?;
        let (balance, notification) = self.notifier.check_in_tx(conn, updated)?;
        Ok(BalanceChange {
            balance,
            notification,
        })
    }
}

/// Balance store with deduction, credit and threshold maintenance.
#[derive(Clone)]
pub struct BalanceLedger {
    db: Database,
    rules: LedgerRules,
    max_conflict_retries: u32,
}

impl BalanceLedger {
    pub fn new(db: Database, rules: LedgerRules) -> Self {
        Self {
            db,
            rules,
            max_conflict_retries: 3,
        }
    }

    /// Build a ledger from the `[ledger]`, `[notify]` and `[dispatch]` sections.
    pub fn from_config(db: Database, config: &TallyConfig) -> Result<Self, TallyError> {
        let rules = LedgerRules {
            defaults: BalanceDefaults {
                currency: config.ledger.default_currency.clone(),
                threshold: config.ledger.threshold()?,
            },
            notifier: ThresholdNotifier::from_config(&config.notify, &config.dispatch),
        };
        Ok(Self::new(db, rules).with_conflict_retries(config.ledger.max_conflict_retries))
    }

    /// Extra attempts made after a `SQLITE_BUSY`/`SQLITE_LOCKED` failure.
    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn rules(&self) -> &LedgerRules {
        &self.rules
    }

    /// Return the pair's balance, creating it with the configured defaults.
    pub async fn get_or_create(
        &self,
        user_id: &UserId,
        provider: Provider,
    ) -> Result<Balance, TallyError> {
        let user = user_id.clone();
        let defaults = self.rules.defaults.clone();
        self.write(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let balance = balances::ensure(&tx, &user, provider, &defaults)?;
            tx.commit()?;
            Ok(balance)
        })
        .await
    }

    /// The pair's balance, if one exists.
    pub async fn get(
        &self,
        user_id: &UserId,
        provider: Provider,
    ) -> Result<Option<Balance>, TallyError> {
        let user = user_id.clone();
        self.db
            .connection()
            .call(move |conn| balances::find(conn, &user, provider))
            .await
            .map_err(map_tr_err)
    }

    pub async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<Balance>, TallyError> {
        balances::list_for_user(&self.db, user_id).await
    }

    /// Subtract `amount` from the pair's balance. The balance may go negative.
    pub async fn deduct(
        &self,
        user_id: &UserId,
        provider: Provider,
        amount: &BigDecimal,
    ) -> Result<BalanceChange, TallyError> {
        validate_amount(amount)?;
        let change = self.adjust(user_id, provider, -amount.clone()).await?;
        debug!(
            user_id = %user_id,
            %provider,
            amount = %amount,
            balance = %change.balance.balance,
            "balance deducted"
        );
        Ok(change)
    }

    /// Add `amount` to the pair's balance.
    pub async fn credit(
        &self,
        user_id: &UserId,
        provider: Provider,
        amount: &BigDecimal,
    ) -> Result<BalanceChange, TallyError> {
        validate_amount(amount)?;
        let change = self.adjust(user_id, provider, amount.clone()).await?;
        info!(
            user_id = %user_id,
            %provider,
            amount = %amount,
            balance = %change.balance.balance,
            "balance credited"
        );
        Ok(change)
    }

    async fn adjust(
        &self,
        user_id: &UserId,
        provider: Provider,
        delta: BigDecimal,
    ) -> Result<BalanceChange, TallyError> {
        let user = user_id.clone();
        let rules = self.rules.clone();
        self.write(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let change = rules.adjust_in_tx(&tx, &user, provider, &delta)?;
            tx.commit()?;
            Ok(change)
        })
        .await
    }

    /// Change the pair's warning threshold and re-evaluate its state.
    ///
    /// Lowering the threshold below the balance re-arms a crossed pair;
    /// raising it above the balance fires a warning.
    pub async fn set_threshold(
        &self,
        user_id: &UserId,
        provider: Provider,
        threshold: &BigDecimal,
    ) -> Result<BalanceChange, TallyError> {
        validate_amount(threshold)?;
        let user = user_id.clone();
        let rules = self.rules.clone();
        let threshold = threshold.clone();
        self.write(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = balances::ensure(&tx, &user, provider, &rules.defaults)?;
            let updated = balances::save_state(
                &tx,
                current.id,
                &current.balance,
                &threshold,
                current.threshold_crossed,
            )?;
            let (balance, notification) = rules.notifier.check_in_tx(&tx, updated)?;
            tx.commit()?;
            Ok(BalanceChange {
                balance,
                notification,
            })
        })
        .await
    }

    /// Store (or clear with `None`) the provider credential for a pair.
    pub async fn set_credential(
        &self,
        user_id: &UserId,
        provider: Provider,
        credential: Option<&str>,
    ) -> Result<Balance, TallyError> {
        let user = user_id.clone();
        let defaults = self.rules.defaults.clone();
        let credential = credential.map(str::to_string);
        self.write(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = balances::ensure(&tx, &user, provider, &defaults)?;
            let balance = balances::set_credential(&tx, current.id, credential.as_deref())?;
            tx.commit()?;
            Ok(balance)
        })
        .await
    }

    /// Run a write on the connection thread, retrying on lock contention.
    pub(crate) async fn write<T, F>(&self, op: F) -> Result<T, TallyError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> rusqlite::Result<T> + Clone + Send + 'static,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let op = op.clone();
            match self.db.connection().call(move |conn| op(conn)).await {
                Ok(value) => return Ok(value),
                Err(e) if is_tr_lock_contention(&e) => {
                    if attempt > self.max_conflict_retries {
                        return Err(TallyError::ConcurrencyConflict { attempts: attempt });
                    }
                    warn!(attempt, "balance write hit a locked database, retrying");
                    tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
                }
                Err(e) => return Err(map_tr_err(e)),
            }
        }
    }
}

fn validate_amount(amount: &BigDecimal) -> Result<(), TallyError> {
    if amount < &BigDecimal::zero() {
        return Err(TallyError::InvalidAmount(format!(
            "amount must not be negative, got {amount}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use tally_storage::models::NotificationStatus;
    use tally_storage::queries::notifications;

    use super::*;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    async fn ledger() -> BalanceLedger {
        let db = Database::open_in_memory().await.unwrap();
        BalanceLedger::new(db, LedgerRules::default())
    }

    #[tokio::test]
    async fn get_or_create_uses_defaults() {
        let ledger = ledger().await;
        let user = UserId::from("alice");

        assert!(ledger.get(&user, Provider::OpenAI).await.unwrap().is_none());
        let balance = ledger.get_or_create(&user, Provider::OpenAI).await.unwrap();
        assert_eq!(balance.balance, dec("0"));
        assert_eq!(balance.currency, "USD");
        assert_eq!(balance.warning_threshold, dec("5.00"));

        let again = ledger.get_or_create(&user, Provider::OpenAI).await.unwrap();
        assert_eq!(again.id, balance.id);
    }

    #[tokio::test]
    async fn credit_then_deduct() {
        let ledger = ledger().await;
        let user = UserId::from("alice");

        let change = ledger.credit(&user, Provider::Anthropic, &dec("20.00")).await.unwrap();
        assert_eq!(change.balance.balance, dec("20.00"));
        assert_eq!(change.notification, NotificationOutcome::None);

        let change = ledger.deduct(&user, Provider::Anthropic, &dec("0.125")).await.unwrap();
        assert_eq!(change.balance.balance, dec("19.875"));
    }

    #[tokio::test]
    async fn negative_amounts_are_rejected() {
        let ledger = ledger().await;
        let user = UserId::from("alice");

        let err = ledger.deduct(&user, Provider::OpenAI, &dec("-1")).await.unwrap_err();
        assert!(matches!(err, TallyError::InvalidAmount(_)));
        let err = ledger.credit(&user, Provider::OpenAI, &dec("-1")).await.unwrap_err();
        assert!(matches!(err, TallyError::InvalidAmount(_)));
        assert!(ledger.get(&user, Provider::OpenAI).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn balance_may_go_negative() {
        let ledger = ledger().await;
        let user = UserId::from("alice");

        ledger.credit(&user, Provider::Google, &dec("1")).await.unwrap();
        let change = ledger.deduct(&user, Provider::Google, &dec("3.5")).await.unwrap();
        assert_eq!(change.balance.balance, dec("-2.5"));
    }

    /// Drives a sequence of target balances and counts warnings.
    async fn warnings_for(sequence: &[&str]) -> usize {
        let ledger = ledger().await;
        let user = UserId::from("seq");
        let mut current = dec("0");
        let mut warned = 0;
        for target in sequence {
            let target = dec(target);
            let change = if target >= current {
                ledger
                    .credit(&user, Provider::OpenAI, &(&target - &current))
                    .await
                    .unwrap()
            } else {
                ledger
                    .deduct(&user, Provider::OpenAI, &(&current - &target))
                    .await
                    .unwrap()
            };
            assert_eq!(change.balance.balance, target);
            if change.notification.is_warned() {
                warned += 1;
            }
            current = target;
        }
        warned
    }

    /// With the default 5.00 threshold the rise from 3 to 4 stays at or
    /// below the threshold, so the pair does not re-arm and the drop to 2
    /// is part of the same crossing. One warning is the intended count.
    #[tokio::test]
    async fn warning_fires_once_per_crossing() {
        assert_eq!(warnings_for(&["10", "6", "4", "3", "4", "2"]).await, 1);
    }

    #[tokio::test]
    async fn warning_rearms_above_threshold() {
        assert_eq!(warnings_for(&["10", "6", "4", "3", "7", "2"]).await, 2);
    }

    #[tokio::test]
    async fn landing_on_threshold_fires() {
        assert_eq!(warnings_for(&["10", "5.00"]).await, 1);
    }

    #[tokio::test]
    async fn first_deduction_from_new_balance_fires() {
        let ledger = ledger().await;
        let change = ledger
            .deduct(&UserId::from("new"), Provider::OpenAI, &dec("0.01"))
            .await
            .unwrap();
        assert!(change.notification.is_warned());
        assert!(change.balance.threshold_crossed);
    }

    #[tokio::test]
    async fn set_threshold_reevaluates() {
        let ledger = ledger().await;
        let user = UserId::from("alice");
        ledger.credit(&user, Provider::OpenAI, &dec("8")).await.unwrap();

        let raised = ledger.set_threshold(&user, Provider::OpenAI, &dec("10")).await.unwrap();
        assert!(raised.notification.is_warned());
        assert_eq!(raised.balance.warning_threshold, dec("10"));

        let lowered = ledger.set_threshold(&user, Provider::OpenAI, &dec("2")).await.unwrap();
        assert_eq!(lowered.notification, NotificationOutcome::None);
        assert!(!lowered.balance.threshold_crossed);

        assert_eq!(
            notifications::count_by_status(ledger.database(), NotificationStatus::Pending)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn credential_round_trip() {
        let ledger = ledger().await;
        let user = UserId::from("alice");

        let stored = ledger
            .set_credential(&user, Provider::OpenAI, Some("sk-live-123"))
            .await
            .unwrap();
        assert_eq!(stored.credential.as_deref(), Some("sk-live-123"));
        assert!(!format!("{stored:?}").contains("sk-live-123"));

        let cleared = ledger.set_credential(&user, Provider::OpenAI, None).await.unwrap();
        assert!(cleared.credential.is_none());
    }

    #[tokio::test]
    async fn concurrent_mutations_lose_no_updates() {
        let ledger = ledger().await;
        let user = UserId::from("busy");
        ledger.credit(&user, Provider::OpenAI, &dec("100")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..40 {
            let ledger = ledger.clone();
            let user = user.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    ledger.deduct(&user, Provider::OpenAI, &dec("1.25")).await
                } else {
                    ledger.credit(&user, Provider::OpenAI, &dec("0.50")).await
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // 100 - 20 * 1.25 + 20 * 0.50
        let balance = ledger.get(&user, Provider::OpenAI).await.unwrap().unwrap();
        assert_eq!(balance.balance, dec("85"));
    }

    #[tokio::test]
    async fn concurrent_get_or_create_yields_one_row() {
        let ledger = ledger().await;
        let user = UserId::from("racer");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            let user = user.clone();
            handles.push(tokio::spawn(async move {
                ledger.get_or_create(&user, Provider::Anthropic).await
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let rows = ledger
            .database()
            .connection()
            .call(move |conn| balances::count_for_pair(conn, &user, Provider::Anthropic))
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn from_config_applies_ledger_defaults() {
        let db = Database::open_in_memory().await.unwrap();
        let config = tally_config::load_config_from_str(
            "[ledger]\ndefault_currency = \"EUR\"\ndefault_threshold = \"12.5\"\n",
        )
        .unwrap();
        let ledger = BalanceLedger::from_config(db, &config).unwrap();

        let balance = ledger
            .get_or_create(&UserId::from("eu"), Provider::Google)
            .await
            .unwrap();
        assert_eq!(balance.currency, "EUR");
        assert_eq!(balance.warning_threshold, dec("12.5"));
    }
}
