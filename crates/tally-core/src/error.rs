// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Tally usage-accounting service.

use thiserror::Error;

/// The error type shared by every Tally crate.
#[derive(Debug, Error)]
pub enum TallyError {
    /// Configuration errors (invalid values, unparsable decimals, unknown backends).
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage backend errors (connection, query failure, row decoding).
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A usage record could not be persisted. No balance change was applied.
    #[error("usage recording failed: {message}")]
    Recording {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A usage event was rejected before touching storage.
    #[error("invalid usage event: {0}")]
    InvalidUsage(String),

    /// A credit, deduction or threshold amount was rejected.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// A balance update could not be serialized against concurrent writers.
    #[error("balance update conflicted with a concurrent writer after {attempts} attempts")]
    ConcurrencyConflict { attempts: u32 },

    /// A single notification could not be delivered.
    #[error("delivery of notification {notification_id} failed: {message}")]
    Delivery {
        notification_id: i64,
        message: String,
    },

    /// A requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TallyError::ConcurrencyConflict { .. } | TallyError::Delivery { .. }
        )
    }
}
