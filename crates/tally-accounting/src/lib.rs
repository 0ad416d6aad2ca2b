// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Usage accounting for the Tally service.
//!
//! This crate provides:
//! - **Usage recorder**: one persisted record per external API call, deducted
//!   from the caller's balance in the same transaction
//! - **Balance ledger**: running balance per (user, provider) with serialized
//!   deductions and credits
//! - **Threshold notifier**: edge-triggered low-balance warnings queued for
//!   later delivery
//! - **Pricing**: per-provider model prices for calls without a cost estimate

pub mod ledger;
pub mod notifier;
pub mod pricing;
pub mod recorder;

pub use ledger::{BalanceChange, BalanceLedger, LedgerRules};
pub use notifier::{NotificationOutcome, ThresholdNotifier, ThresholdTransition, evaluate};
pub use recorder::{UsageEvent, UsageReceipt, UsageRecorder};
