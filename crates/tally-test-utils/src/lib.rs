// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities for Tally integration tests.
//!
//! # Components
//!
//! - [`MockSink`] - Notification sink that records deliveries and fails on demand
//! - [`TestHarness`] - Ledger, recorder and dispatcher over a temp database

pub mod harness;
pub mod mock_sink;

pub use harness::TestHarness;
pub use mock_sink::MockSink;
