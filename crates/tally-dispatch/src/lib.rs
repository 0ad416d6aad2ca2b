// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Notification dispatch for the Tally service.
//!
//! [`ScheduledDispatcher`] drains the notification queue in batches through a
//! [`NotificationSink`](tally_core::NotificationSink). The built-in sinks log
//! the notice or POST it to a webhook.

pub mod dispatcher;
pub mod sinks;

pub use dispatcher::{DispatchReport, ScheduledDispatcher};
pub use sinks::{LogSink, WebhookSink, sink_from_config};
