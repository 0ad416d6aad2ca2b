// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Recording notification sink for deterministic testing.
//!
//! `MockSink` captures every delivered notice and can be told to fail the
//! next N deliveries or every delivery of specific notification ids.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use tally_core::{LowBalanceNotice, NotificationSink, TallyError};

#[derive(Default)]
struct FailurePlan {
    next: u32,
    ids: HashSet<i64>,
}

/// A notification sink that records what it receives.
#[derive(Clone, Default)]
pub struct MockSink {
    delivered: Arc<Mutex<Vec<LowBalanceNotice>>>,
    attempts: Arc<Mutex<u32>>,
    plan: Arc<Mutex<FailurePlan>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` deliveries, whatever their id.
    pub async fn fail_next(&self, count: u32) {
        self.plan.lock().await.next = count;
    }

    /// Fail every delivery of `notification_id` until [`heal`](Self::heal).
    pub async fn fail_for(&self, notification_id: i64) {
        self.plan.lock().await.ids.insert(notification_id);
    }

    /// Clear every planned failure.
    pub async fn heal(&self) {
        *self.plan.lock().await = FailurePlan::default();
    }

    /// Notices delivered successfully, in delivery order.
    pub async fn delivered(&self) -> Vec<LowBalanceNotice> {
        self.delivered.lock().await.clone()
    }

    pub async fn delivered_ids(&self) -> Vec<i64> {
        self.delivered
            .lock()
            .await
            .iter()
            .map(|n| n.notification_id)
            .collect()
    }

    /// Every call to `deliver`, successful or not.
    pub async fn attempts(&self) -> u32 {
        *self.attempts.lock().await
    }
}

#[async_trait]
impl NotificationSink for MockSink {
    fn name(&self) -> &str {
        "mock"
    }

    async fn deliver(&self, notice: &LowBalanceNotice) -> Result<(), TallyError> {
        *self.attempts.lock().await += 1;

        {
            let mut plan = self.plan.lock().await;
            let planned = if plan.next > 0 {
                plan.next -= 1;
                true
            } else {
                plan.ids.contains(&notice.notification_id)
            };
            if planned {
                return Err(TallyError::Delivery {
                    notification_id: notice.notification_id,
                    message: "mock sink failure".into(),
                });
            }
        }

        self.delivered.lock().await.push(notice.clone());
        Ok(())
    }
}
