// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed query modules.
//!
//! Functions taking `&rusqlite::Connection` run on the caller's connection or
//! open transaction (a `Transaction` derefs to `Connection`), so multi-step
//! ledger operations compose into one commit. Async functions taking
//! `&Database` are standalone operations.

pub mod balances;
pub mod notifications;
pub mod usage;
