// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-call usage recording.
//!
//! A recorded call inserts its `usage_records` row and deducts its cost from
//! the (user, provider) balance in one transaction. Either both land or
//! neither does.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use rusqlite::TransactionBehavior;
use serde::Serialize;
use tally_core::{Balance, Provider, TallyError, UsageRecord, UserId};
use tally_storage::queries::usage;
use tally_storage::{NewUsageRecord, UsageSummary};
use tracing::info;

use crate::ledger::BalanceLedger;
use crate::notifier::NotificationOutcome;
use crate::pricing;

/// One completed external API call.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub user_id: UserId,
    pub provider: Provider,
    pub model_name: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub related_task_id: Option<String>,
}

impl UsageEvent {
    pub fn new(user_id: impl Into<UserId>, provider: Provider, model_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            provider,
            model_name: model_name.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            related_task_id: None,
        }
    }

    pub fn tokens(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
        self
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.related_task_id = Some(task_id.into());
        self
    }
}

/// What a successful [`UsageRecorder::record`] persisted.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReceipt {
    pub record: UsageRecord,
    pub balance: Balance,
    pub notification: NotificationOutcome,
}

/// Records usage events against the balance ledger.
#[derive(Clone)]
pub struct UsageRecorder {
    ledger: BalanceLedger,
}

impl UsageRecorder {
    pub fn new(ledger: BalanceLedger) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &BalanceLedger {
        &self.ledger
    }

    /// Persist `event` with an explicit `cost` and deduct it from the balance.
    ///
    /// Input errors are `InvalidUsage` and touch nothing. Any failure after
    /// that is `Recording`, with the transaction rolled back.
    pub async fn record(
        &self,
        event: &UsageEvent,
        cost: BigDecimal,
    ) -> Result<UsageReceipt, TallyError> {
        validate(event, &cost)?;

        let new_record = NewUsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: event.user_id.clone(),
            provider: event.provider,
            model_name: event.model_name.trim().to_string(),
            prompt_tokens: event.prompt_tokens,
            completion_tokens: event.completion_tokens,
            cost,
            related_task_id: event.related_task_id.clone(),
        };
        let rules = self.ledger.rules().clone();

        let receipt = self
            .ledger
            .write(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let record = usage::insert_record(&tx, &new_record)?;
                let delta = -new_record.cost.clone();
                let change =
                    rules.adjust_in_tx(&tx, &new_record.user_id, new_record.provider, &delta)?;
                tx.commit()?;
                Ok(UsageReceipt {
                    record,
                    balance: change.balance,
                    notification: change.notification,
                })
            })
            .await
            .map_err(|e| TallyError::Recording {
                message: format!(
                    "could not record {} usage for user {}",
                    event.provider, event.user_id
                ),
                source: Some(Box::new(e)),
            })?;

        info!(
            user_id = %receipt.record.user_id,
            provider = %receipt.record.provider,
            model = %receipt.record.model_name,
            prompt_tokens = receipt.record.prompt_tokens,
            completion_tokens = receipt.record.completion_tokens,
            cost = %receipt.record.cost,
            balance = %receipt.balance.balance,
            "usage recorded"
        );
        Ok(receipt)
    }

    /// Like [`record`](Self::record), with the cost taken from the pricing table.
    ///
    /// The table is in USD, so a pair whose balance is kept in any other
    /// currency is refused with `InvalidUsage`; pass an explicit cost instead.
    pub async fn record_priced(&self, event: &UsageEvent) -> Result<UsageReceipt, TallyError> {
        let currency = match self.ledger.get(&event.user_id, event.provider).await? {
            Some(balance) => balance.currency,
            None => self.ledger.rules().defaults.currency.clone(),
        };
        if currency != pricing::PRICING_CURRENCY {
            return Err(TallyError::InvalidUsage(format!(
                "built-in prices are in {}, but the {} balance for user {} is in {currency}",
                pricing::PRICING_CURRENCY,
                event.provider,
                event.user_id
            )));
        }

        let pricing = pricing::get_pricing(event.provider, &event.model_name);
        let cost =
            pricing::calculate_cost(event.prompt_tokens, event.completion_tokens, &pricing);
        self.record(event, cost).await
    }

    /// Usage totals for a user, optionally for one provider and from `since`.
    pub async fn summary(
        &self,
        user_id: &UserId,
        provider: Option<Provider>,
        since: Option<DateTime<Utc>>,
    ) -> Result<UsageSummary, TallyError> {
        let since = since.map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string());
        usage::summarize(self.ledger.database(), user_id, provider, since.as_deref()).await
    }

    /// Records made on behalf of one background task.
    pub async fn records_for_task(&self, task_id: &str) -> Result<Vec<UsageRecord>, TallyError> {
        usage::list_for_task(self.ledger.database(), task_id).await
    }
}

fn validate(event: &UsageEvent, cost: &BigDecimal) -> Result<(), TallyError> {
    if event.user_id.as_str().trim().is_empty() {
        return Err(TallyError::InvalidUsage("user id must not be empty".into()));
    }
    if event.model_name.trim().is_empty() {
        return Err(TallyError::InvalidUsage("model name must not be empty".into()));
    }
    if cost < &BigDecimal::zero() {
        return Err(TallyError::InvalidUsage(format!(
            "cost must not be negative, got {cost}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use tally_storage::Database;
    use tally_storage::models::NotificationStatus;
    use tally_storage::queries::notifications;

    use super::*;
    use crate::ledger::LedgerRules;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    async fn recorder() -> UsageRecorder {
        let db = Database::open_in_memory().await.unwrap();
        UsageRecorder::new(BalanceLedger::new(db, LedgerRules::default()))
    }

    async fn usage_rows(recorder: &UsageRecorder) -> i64 {
        recorder
            .ledger()
            .database()
            .connection()
            .call(|conn| -> rusqlite::Result<i64> {
                conn.query_row("SELECT COUNT(*) FROM usage_records", [], |row| row.get(0))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn record_derives_total_and_deducts() {
        let recorder = recorder().await;
        let user = UserId::from("alice");
        recorder
            .ledger()
            .credit(&user, Provider::OpenAI, &dec("10"))
            .await
            .unwrap();

        let event = UsageEvent::new("alice", Provider::OpenAI, "gpt-4o").tokens(100, 50);
        let receipt = recorder.record(&event, dec("0.75")).await.unwrap();

        assert_eq!(receipt.record.total_tokens, 150);
        assert_eq!(receipt.record.cost, dec("0.75"));
        assert_eq!(receipt.balance.balance, dec("9.25"));
        assert_eq!(receipt.notification, NotificationOutcome::None);
        assert_eq!(receipt.record.id.len(), 36);
    }

    #[tokio::test]
    async fn record_priced_uses_pricing_table() {
        let recorder = recorder().await;
        let event = UsageEvent::new("bob", Provider::OpenAI, "gpt-4o").tokens(100, 50);

        let receipt = recorder.record_priced(&event).await.unwrap();
        assert_eq!(receipt.record.cost, dec("0.00075"));
        assert_eq!(receipt.balance.balance, dec("-0.00075"));
    }

    #[tokio::test]
    async fn record_priced_refuses_non_usd_balances() {
        let db = Database::open_in_memory().await.unwrap();
        let rules = LedgerRules {
            defaults: tally_storage::BalanceDefaults {
                currency: "EUR".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let recorder = UsageRecorder::new(BalanceLedger::new(db, rules));
        let event = UsageEvent::new("dora", Provider::OpenAI, "gpt-4o").tokens(100, 50);

        let err = recorder.record_priced(&event).await.unwrap_err();
        assert!(matches!(err, TallyError::InvalidUsage(_)), "got {err:?}");
        assert_eq!(usage_rows(&recorder).await, 0);

        // An explicit cost in the balance's own currency is still accepted.
        let receipt = recorder.record(&event, dec("0.50")).await.unwrap();
        assert_eq!(receipt.balance.currency, "EUR");
    }

    #[tokio::test]
    async fn crossing_during_record_enqueues_once() {
        let recorder = recorder().await;
        let user = UserId::from("carol");
        recorder
            .ledger()
            .credit(&user, Provider::Anthropic, &dec("6"))
            .await
            .unwrap();

        let event = UsageEvent::new("carol", Provider::Anthropic, "claude-sonnet-4").tokens(10, 10);
        let first = recorder.record(&event, dec("2")).await.unwrap();
        let second = recorder.record(&event, dec("1")).await.unwrap();

        assert!(first.notification.is_warned());
        assert_eq!(second.notification, NotificationOutcome::None);
        assert_eq!(
            notifications::count_by_status(recorder.ledger().database(), NotificationStatus::Pending)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn invalid_events_write_nothing() {
        let recorder = recorder().await;

        let empty_model = UsageEvent::new("dave", Provider::Google, "  ");
        let err = recorder.record(&empty_model, dec("1")).await.unwrap_err();
        assert!(matches!(err, TallyError::InvalidUsage(_)));

        let event = UsageEvent::new("dave", Provider::Google, "gemini-1.5-flash");
        let err = recorder.record(&event, dec("-0.01")).await.unwrap_err();
        assert!(matches!(err, TallyError::InvalidUsage(_)));

        assert_eq!(usage_rows(&recorder).await, 0);
        assert!(
            recorder
                .ledger()
                .get(&UserId::from("dave"), Provider::Google)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn failed_recording_leaves_no_trace() {
        let recorder = recorder().await;
        let user = UserId::from("erin");
        recorder
            .ledger()
            .credit(&user, Provider::OpenAI, &dec("6"))
            .await
            .unwrap();

        // Make the notification enqueue fail after the usage insert and the
        // balance update have already run inside the transaction.
        recorder
            .ledger()
            .database()
            .connection()
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_notifications BEFORE INSERT ON notifications
                     BEGIN SELECT RAISE(ABORT, 'notification queue unavailable'); END;",
                )
            })
            .await
            .unwrap();

        let event = UsageEvent::new("erin", Provider::OpenAI, "gpt-4o").tokens(100, 50);
        let err = recorder.record(&event, dec("2")).await.unwrap_err();
        assert!(matches!(err, TallyError::Recording { .. }), "got {err:?}");

        let balance = recorder.ledger().get(&user, Provider::OpenAI).await.unwrap().unwrap();
        assert_eq!(balance.balance, dec("6"));
        assert!(!balance.threshold_crossed);
        assert_eq!(usage_rows(&recorder).await, 0);
    }

    #[tokio::test]
    async fn summary_and_task_lookup() {
        let recorder = recorder().await;
        let task_event = UsageEvent::new("frank", Provider::OpenAI, "gpt-4o-mini")
            .tokens(1_000, 500)
            .task("import-42");
        recorder.record(&task_event, dec("0.01")).await.unwrap();
        recorder.record(&task_event, dec("0.02")).await.unwrap();
        let other = UsageEvent::new("frank", Provider::Google, "gemini-1.5-pro").tokens(10, 10);
        recorder.record(&other, dec("0.5")).await.unwrap();

        let records = recorder.records_for_task("import-42").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.total_tokens == 1_500));

        let summary = recorder
            .summary(&UserId::from("frank"), None, None)
            .await
            .unwrap();
        assert_eq!(summary.total_calls(), 3);
        assert_eq!(summary.total_cost(), dec("0.53"));

        let since_tomorrow = Utc::now() + chrono::Duration::days(1);
        let empty = recorder
            .summary(&UserId::from("frank"), Some(Provider::OpenAI), Some(since_tomorrow))
            .await
            .unwrap();
        assert_eq!(empty.total_calls(), 0);
    }
}
