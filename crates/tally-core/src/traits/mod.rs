// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Collaborator traits implemented outside the core crate.

pub mod sink;

pub use sink::NotificationSink;
