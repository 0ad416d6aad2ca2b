// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Delivery channel for low-balance notifications.

use async_trait::async_trait;

use crate::error::TallyError;
use crate::types::LowBalanceNotice;

/// The messaging collaborator the dispatcher hands queued notifications to.
///
/// Implementations must treat each call independently: a failure is reported
/// as [`TallyError::Delivery`] and the dispatcher decides whether to retry.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    /// Short backend name used in logs (e.g. "log", "webhook").
    fn name(&self) -> &str;

    /// Delivers a single notice.
    async fn deliver(&self, notice: &LowBalanceNotice) -> Result<(), TallyError>;
}
