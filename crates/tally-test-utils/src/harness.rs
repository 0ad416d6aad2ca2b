// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test harness for end-to-end accounting and dispatch tests.
//!
//! `TestHarness` wires a temp-file database, the ledger, the recorder and a
//! dispatcher backed by [`MockSink`], all built from a [`TallyConfig`].

use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use tally_accounting::{BalanceLedger, UsageEvent, UsageReceipt, UsageRecorder};
use tally_config::TallyConfig;
use tally_core::{Balance, Provider, TallyError, UserId};
use tally_dispatch::ScheduledDispatcher;
use tally_storage::Database;

use crate::mock_sink::MockSink;

/// Builder for [`TestHarness`].
pub struct TestHarnessBuilder {
    config: TallyConfig,
}

impl TestHarnessBuilder {
    fn new() -> Self {
        Self {
            config: TallyConfig::default(),
        }
    }

    /// Warning threshold for new balances.
    pub fn with_threshold(mut self, threshold: &str) -> Self {
        self.config.ledger.default_threshold = threshold.to_string();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.dispatch.max_attempts = max_attempts;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.config.dispatch.batch_size = batch_size;
        self
    }

    pub fn with_notifications_enabled(mut self, enabled: bool) -> Self {
        self.config.notify.enabled = enabled;
        self
    }

    pub async fn build(mut self) -> Result<TestHarness, TallyError> {
        let temp_dir = tempfile::TempDir::new().map_err(|e| TallyError::Storage {
            source: Box::new(e),
        })?;
        self.config.storage.database_path = temp_dir
            .path()
            .join("tally-test.db")
            .to_string_lossy()
            .into_owned();

        let db = Database::from_config(&self.config.storage).await?;
        let ledger = BalanceLedger::from_config(db.clone(), &self.config)?;
        let recorder = UsageRecorder::new(ledger.clone());
        let sink = MockSink::new();
        let dispatcher =
            ScheduledDispatcher::from_config(db.clone(), Arc::new(sink.clone()), &self.config.dispatch);

        Ok(TestHarness {
            db,
            ledger,
            recorder,
            dispatcher,
            sink,
            config: self.config,
            _temp_dir: temp_dir,
        })
    }
}

/// A complete accounting stack over a temp database.
pub struct TestHarness {
    pub db: Database,
    pub ledger: BalanceLedger,
    pub recorder: UsageRecorder,
    pub dispatcher: ScheduledDispatcher,
    pub sink: MockSink,
    pub config: TallyConfig,
    /// Kept alive so the database file outlives the harness.
    _temp_dir: tempfile::TempDir,
}

impl TestHarness {
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::new()
    }

    /// Path of the harness database, for opening extra connections.
    pub fn database_path(&self) -> &str {
        &self.config.storage.database_path
    }

    /// Credit `amount` (decimal text) to a pair.
    pub async fn fund(
        &self,
        user: &str,
        provider: Provider,
        amount: &str,
    ) -> Result<Balance, TallyError> {
        let amount = decimal(amount)?;
        let change = self.ledger.credit(&UserId::from(user), provider, &amount).await?;
        Ok(change.balance)
    }

    /// Record one call with an explicit cost (decimal text).
    pub async fn spend(
        &self,
        user: &str,
        provider: Provider,
        cost: &str,
    ) -> Result<UsageReceipt, TallyError> {
        let event = UsageEvent::new(user, provider, "test-model").tokens(100, 50);
        self.recorder.record(&event, decimal(cost)?).await
    }

    pub async fn balance(&self, user: &str, provider: Provider) -> Result<Balance, TallyError> {
        self.ledger
            .get(&UserId::from(user), provider)
            .await?
            .ok_or_else(|| TallyError::NotFound(format!("balance for {user}/{provider}")))
    }
}

fn decimal(text: &str) -> Result<BigDecimal, TallyError> {
    BigDecimal::from_str(text)
        .map_err(|e| TallyError::InvalidAmount(format!("`{text}` is not a decimal: {e}")))
}
