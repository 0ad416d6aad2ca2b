// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite persistence layer for the Tally usage-accounting service.
//!
//! Provides WAL-mode SQLite storage with embedded migrations, a single-writer
//! concurrency model via `tokio-rusqlite`, and typed queries for usage
//! records, balances and the low-balance notification queue.

pub mod database;
pub mod migrations;
pub mod models;
pub mod queries;

pub use database::{Database, OpenOptions};
pub use models::*;
