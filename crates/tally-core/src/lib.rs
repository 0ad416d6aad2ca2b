// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Tally usage-accounting service.
//!
//! This crate provides the error type, the domain types persisted by
//! `tally-storage`, and the [`NotificationSink`] trait that delivery
//! backends implement.

pub mod error;
pub mod traits;
pub mod types;

pub use error::TallyError;
pub use traits::NotificationSink;
pub use types::{Balance, LowBalanceNotice, Provider, UsageRecord, UserId};

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bigdecimal::BigDecimal;

    use super::*;

    #[test]
    fn provider_display_and_parse() {
        assert_eq!(Provider::OpenAI.to_string(), "openai");
        assert_eq!(Provider::Anthropic.to_string(), "anthropic");
        assert_eq!(Provider::Google.to_string(), "google");

        for provider in Provider::ALL {
            let parsed = Provider::from_str(&provider.to_string()).expect("should parse back");
            assert_eq!(provider, parsed);
        }
        assert_eq!(Provider::from_str("OpenAI").unwrap(), Provider::OpenAI);
        assert!(Provider::from_str("mistral").is_err());
    }

    #[test]
    fn provider_serialization() {
        let json = serde_json::to_string(&Provider::Google).unwrap();
        assert_eq!(json, "\"google\"");
        let parsed: Provider = serde_json::from_str("\"anthropic\"").unwrap();
        assert_eq!(parsed, Provider::Anthropic);
    }

    #[test]
    fn retryable_errors() {
        assert!(TallyError::ConcurrencyConflict { attempts: 3 }.is_retryable());
        assert!(
            TallyError::Delivery {
                notification_id: 1,
                message: "timeout".into(),
            }
            .is_retryable()
        );
        assert!(!TallyError::InvalidUsage("negative cost".into()).is_retryable());
        assert!(
            !TallyError::Recording {
                message: "disk full".into(),
                source: None,
            }
            .is_retryable()
        );
    }

    fn sample_balance(balance: &str) -> Balance {
        Balance {
            id: 1,
            user_id: UserId::from("user-1"),
            provider: Provider::OpenAI,
            balance: BigDecimal::from_str(balance).unwrap(),
            currency: "USD".into(),
            warning_threshold: BigDecimal::from_str("5.00").unwrap(),
            threshold_crossed: false,
            credential: Some("sk-secret".into()),
            created_at: "2026-01-01T00:00:00.000Z".into(),
            updated_at: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn threshold_comparison_is_inclusive() {
        assert!(sample_balance("5.00").is_below_threshold());
        assert!(sample_balance("4.99").is_below_threshold());
        assert!(!sample_balance("5.01").is_below_threshold());
    }

    #[test]
    fn balance_debug_redacts_credential() {
        let rendered = format!("{:?}", sample_balance("10"));
        assert!(!rendered.contains("sk-secret"), "credential leaked: {rendered}");
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn notice_summary_mentions_amounts() {
        let notice = LowBalanceNotice {
            notification_id: 7,
            user_id: UserId::from("alice"),
            provider: Provider::Anthropic,
            balance: BigDecimal::from_str("4.20").unwrap(),
            threshold: BigDecimal::from_str("5.00").unwrap(),
            currency: "USD".into(),
            created_at: "2026-01-01T00:00:00.000Z".into(),
        };
        let summary = notice.summary();
        assert!(summary.contains("anthropic"));
        assert!(summary.contains("alice"));
        assert!(summary.contains("4.20"));
        assert!(summary.contains("5.00"));
    }
}
