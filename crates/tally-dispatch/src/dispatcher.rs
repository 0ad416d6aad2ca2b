// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Periodic delivery of queued low-balance notifications.
//!
//! Each run releases expired leases, then claims and delivers pending rows
//! one at a time through the configured [`NotificationSink`]. A row is
//! leased just before its delivery, and a delivery that outlives the lease
//! is abandoned so that another run can take the row over without sending
//! it twice. A failure is recorded on its row and the run moves on; nothing
//! a single notification does can abort the batch.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tally_config::model::DispatchConfig;
use tally_core::{NotificationSink, TallyError};
use tally_storage::Database;
use tally_storage::models::{NotificationEntry, NotificationStatus};
use tally_storage::queries::notifications;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters for one dispatch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Stale `processing` rows returned to the queue.
    pub released: usize,
    pub claimed: usize,
    pub sent: usize,
    /// Failed this run, will be tried again.
    pub retried: usize,
    /// Failed for the last time and parked as `failed`.
    pub failed: usize,
    /// Rows whose lease passed to another dispatcher before the outcome was stored.
    pub lost_leases: usize,
    /// Storage operations that errored during the run.
    pub storage_errors: usize,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }
}

/// Delivers pending notifications on an external or internal schedule.
#[derive(Clone)]
pub struct ScheduledDispatcher {
    db: Database,
    sink: Arc<dyn NotificationSink>,
    batch_size: u32,
    lease: Duration,
}

impl ScheduledDispatcher {
    pub fn new(db: Database, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            db,
            sink,
            batch_size: 100,
            lease: Duration::from_secs(300),
        }
    }

    pub fn from_config(
        db: Database,
        sink: Arc<dyn NotificationSink>,
        config: &DispatchConfig,
    ) -> Self {
        Self::new(db, sink)
            .with_batch_size(config.batch_size)
            .with_lease(Duration::from_secs(config.lock_timeout_secs))
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// How long a claimed row stays invisible to other runs. Also bounds a
    /// single delivery. Kept to millisecond precision.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    /// Deliver up to one batch of pending notifications.
    pub async fn dispatch_pending(&self) -> DispatchReport {
        let mut report = DispatchReport::default();

        match notifications::release_expired(&self.db).await {
            Ok(0) => {}
            Ok(released) => {
                warn!(released, "returned notifications with expired leases to the queue");
                report.released = released;
            }
            Err(e) => {
                error!(error = %e, "failed to release expired notification leases");
                report.storage_errors += 1;
            }
        }

        // Walk forward by id so a row that fails this run is not retried in it.
        let mut cursor = 0;
        while report.claimed < self.batch_size as usize {
            let entry = match notifications::claim_next(&self.db, cursor, self.lease).await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to claim pending notification");
                    report.storage_errors += 1;
                    break;
                }
            };
            cursor = entry.id;
            report.claimed += 1;
            self.deliver_one(&entry, &mut report).await;
        }

        if report.is_empty() {
            debug!("no pending notifications");
            return report;
        }
        info!(
            claimed = report.claimed,
            sent = report.sent,
            retried = report.retried,
            failed = report.failed,
            lost_leases = report.lost_leases,
            "dispatch run complete"
        );
        report
    }

    async fn deliver_one(&self, entry: &NotificationEntry, report: &mut DispatchReport) {
        let notice = entry.to_notice();
        let outcome = match tokio::time::timeout(self.lease, self.sink.deliver(&notice)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TallyError::Delivery {
                notification_id: entry.id,
                message: format!("delivery did not finish within the {:?} lease", self.lease),
            }),
        };

        match outcome {
            Ok(()) => match notifications::mark_sent(&self.db, entry).await {
                Ok(true) => {
                    report.sent += 1;
                    info!(
                        notification_id = entry.id,
                        user_id = %entry.user_id,
                        provider = %entry.provider,
                        sink = self.sink.name(),
                        "low-balance notification sent"
                    );
                }
                Ok(false) => {
                    report.lost_leases += 1;
                    warn!(notification_id = entry.id, "lease lost before delivery was recorded");
                }
                Err(e) => {
                    // The lease expires and the row is offered again.
                    error!(notification_id = entry.id, error = %e, "failed to mark notification sent");
                    report.storage_errors += 1;
                }
            },
            Err(delivery_err) => {
                let message = delivery_err.to_string();
                match notifications::mark_failed(&self.db, entry, &message).await {
                    Ok(Some(NotificationStatus::Failed)) => {
                        report.failed += 1;
                        error!(
                            notification_id = entry.id,
                            attempts = entry.attempts + 1,
                            error = %message,
                            "notification dropped after final delivery attempt"
                        );
                    }
                    Ok(Some(_)) => {
                        report.retried += 1;
                        warn!(
                            notification_id = entry.id,
                            attempts = entry.attempts + 1,
                            max_attempts = entry.max_attempts,
                            error = %message,
                            "notification delivery failed, will retry"
                        );
                    }
                    Ok(None) => {
                        report.lost_leases += 1;
                        warn!(notification_id = entry.id, error = %message, "lease lost before failure was recorded");
                    }
                    Err(e) => {
                        error!(notification_id = entry.id, error = %e, "failed to record delivery failure");
                        report.storage_errors += 1;
                    }
                }
            }
        }
    }

    /// Run [`dispatch_pending`](Self::dispatch_pending) every `interval`
    /// until `cancel` fires. The first run happens immediately.
    ///
    /// Returns the number of completed runs.
    pub async fn run_scheduled(&self, interval: Duration, cancel: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut runs = 0;

        info!(
            interval_secs = interval.as_secs(),
            sink = self.sink.name(),
            "notification dispatcher started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.dispatch_pending().await;
                    runs += 1;
                }
                _ = cancel.cancelled() => {
                    info!(runs, "notification dispatcher shutting down");
                    break;
                }
            }
        }
        runs
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::str::FromStr;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bigdecimal::BigDecimal;
    use tally_core::{LowBalanceNotice, Provider, TallyError, UserId};
    use tally_storage::BalanceDefaults;
    use tally_storage::queries::balances;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<i64>>,
        failing: Mutex<HashSet<i64>>,
    }

    impl RecordingSink {
        fn delivered(&self) -> Vec<i64> {
            self.delivered.lock().unwrap().clone()
        }

        fn fail_for(&self, id: i64) {
            self.failing.lock().unwrap().insert(id);
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, notice: &LowBalanceNotice) -> Result<(), TallyError> {
            if self.failing.lock().unwrap().contains(&notice.notification_id) {
                return Err(TallyError::Delivery {
                    notification_id: notice.notification_id,
                    message: "simulated outage".into(),
                });
            }
            self.delivered.lock().unwrap().push(notice.notification_id);
            Ok(())
        }
    }

    async fn enqueue(db: &Database, user: &str, max_attempts: u32) -> i64 {
        let user = UserId::from(user);
        db.connection()
            .call(move |conn| -> rusqlite::Result<i64> {
                let row =
                    balances::ensure(conn, &user, Provider::OpenAI, &BalanceDefaults::default())?;
                let row = balances::save_state(
                    conn,
                    row.id,
                    &BigDecimal::from_str("1.00").unwrap(),
                    &row.warning_threshold,
                    true,
                )?;
                notifications::enqueue(conn, &row, max_attempts)
            })
            .await
            .unwrap()
    }

    async fn setup() -> (Database, Arc<RecordingSink>, ScheduledDispatcher) {
        let db = Database::open_in_memory().await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = ScheduledDispatcher::new(db.clone(), sink.clone());
        (db, sink, dispatcher)
    }

    #[tokio::test]
    async fn empty_queue_sends_nothing() {
        let (_db, sink, dispatcher) = setup().await;
        let report = dispatcher.dispatch_pending().await;
        assert_eq!(report.sent, 0);
        assert!(report.is_empty());
        assert!(sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn notification_is_delivered_exactly_once() {
        let (db, sink, dispatcher) = setup().await;
        let id = enqueue(&db, "alice", 3).await;

        let first = dispatcher.dispatch_pending().await;
        let second = dispatcher.dispatch_pending().await;

        assert_eq!(first.sent, 1);
        assert_eq!(second.sent, 0);
        assert_eq!(sink.delivered(), vec![id]);
        let entry = notifications::get(&db, id).await.unwrap().unwrap();
        assert_eq!(entry.status, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn failure_does_not_abort_batch() {
        let (db, sink, dispatcher) = setup().await;
        let a = enqueue(&db, "a", 3).await;
        let b = enqueue(&db, "b", 3).await;
        let c = enqueue(&db, "c", 3).await;
        sink.fail_for(b);

        let report = dispatcher.dispatch_pending().await;
        assert_eq!(report.claimed, 3);
        assert_eq!(report.sent, 2);
        assert_eq!(report.retried, 1);
        assert_eq!(sink.delivered(), vec![a, c]);

        let entry = notifications::get(&db, b).await.unwrap().unwrap();
        assert_eq!(entry.status, NotificationStatus::Pending);
        assert_eq!(entry.attempts, 1);
        assert!(entry.last_error.unwrap().contains("simulated outage"));

        sink.heal();
        let report = dispatcher.dispatch_pending().await;
        assert_eq!(report.sent, 1);
        assert_eq!(sink.delivered(), vec![a, c, b]);
    }

    #[tokio::test]
    async fn notification_is_dropped_after_max_attempts() {
        let (db, sink, dispatcher) = setup().await;
        let id = enqueue(&db, "alice", 2).await;
        sink.fail_for(id);

        assert_eq!(dispatcher.dispatch_pending().await.retried, 1);
        assert_eq!(dispatcher.dispatch_pending().await.failed, 1);
        assert!(dispatcher.dispatch_pending().await.is_empty());

        let entry = notifications::get(&db, id).await.unwrap().unwrap();
        assert_eq!(entry.status, NotificationStatus::Failed);
        assert_eq!(entry.attempts, 2);
    }

    #[tokio::test]
    async fn batch_size_limits_a_run() {
        let (db, sink, dispatcher) = setup().await;
        let dispatcher = dispatcher.with_batch_size(2);
        for user in ["a", "b", "c", "d", "e"] {
            enqueue(&db, user, 3).await;
        }

        assert_eq!(dispatcher.dispatch_pending().await.sent, 2);
        assert_eq!(dispatcher.dispatch_pending().await.sent, 2);
        assert_eq!(dispatcher.dispatch_pending().await.sent, 1);
        assert_eq!(sink.delivered().len(), 5);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let (db, sink, dispatcher) = setup().await;
        let id = enqueue(&db, "alice", 3).await;

        // Simulate a dispatcher that crashed after claiming the row.
        notifications::claim_next(&db, 0, Duration::from_secs(300))
            .await
            .unwrap();
        db.connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE notifications SET locked_until = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
                    rusqlite::params![id],
                )
            })
            .await
            .unwrap();

        let report = dispatcher.dispatch_pending().await;
        assert_eq!(report.released, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(sink.delivered(), vec![id]);
    }

    struct StalledSink;

    #[async_trait]
    impl NotificationSink for StalledSink {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn deliver(&self, _notice: &LowBalanceNotice) -> Result<(), TallyError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivery_outliving_its_lease_is_abandoned() {
        let db = Database::open_in_memory().await.unwrap();
        let id = enqueue(&db, "alice", 3).await;
        let dispatcher = ScheduledDispatcher::new(db.clone(), Arc::new(StalledSink))
            .with_lease(Duration::from_millis(200));

        let report = dispatcher.dispatch_pending().await;
        assert_eq!(report.claimed, 1);
        assert_eq!(report.sent, 0);
        assert_eq!(report.retried + report.lost_leases, 1);

        let entry = notifications::get(&db, id).await.unwrap().unwrap();
        assert_ne!(entry.status, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn scheduled_loop_delivers_and_stops_on_cancel() {
        let (db, sink, dispatcher) = setup().await;
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            dispatcher
                .run_scheduled(Duration::from_millis(20), loop_cancel)
                .await
        });

        let id = enqueue(&db, "alice", 3).await;
        for _ in 0..100 {
            if !sink.delivered().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();

        let runs = handle.await.unwrap();
        assert!(runs >= 1);
        assert_eq!(sink.delivered(), vec![id]);
    }
}
