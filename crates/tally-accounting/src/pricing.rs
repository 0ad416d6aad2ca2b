// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model pricing tables and cost calculation.
//!
//! Prices are USD per million tokens, taken from the providers' public
//! price lists:
//!
//! OpenAI     gpt-4o-mini 0.15 / 0.60, gpt-4o 2.50 / 10.00,
//!            o1 15.00 / 60.00, gpt-3.5-turbo 0.50 / 1.50
//! Anthropic  haiku 0.80 / 4.00, sonnet 3.00 / 15.00, opus 15.00 / 75.00
//! Google     gemini flash 0.075 / 0.30, gemini pro 1.25 / 5.00

use bigdecimal::BigDecimal;
use tally_core::Provider;

/// Currency every price in this table is quoted in.
pub const PRICING_CURRENCY: &str = "USD";

/// Per-model pricing in USD per million tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPricing {
    pub prompt_per_mtok: BigDecimal,
    pub completion_per_mtok: BigDecimal,
}

/// `units * 10^-scale` USD.
fn usd(units: i64, scale: i64) -> BigDecimal {
    BigDecimal::new(units.into(), scale)
}

fn pricing(prompt: BigDecimal, completion: BigDecimal) -> ModelPricing {
    ModelPricing {
        prompt_per_mtok: prompt,
        completion_per_mtok: completion,
    }
}

/// Look up pricing for a model of `provider`.
///
/// Matches on lowercase substrings of the model name. Unknown models fall
/// back to the provider's mid-tier price so usage is never recorded as free.
pub fn get_pricing(provider: Provider, model: &str) -> ModelPricing {
    let lower = model.to_lowercase();

    match provider {
        Provider::OpenAI => {
            if lower.contains("gpt-4o-mini") {
                pricing(usd(15, 2), usd(60, 2))
            } else if lower.starts_with("o1") || lower.starts_with("o3") {
                pricing(usd(15, 0), usd(60, 0))
            } else if lower.contains("gpt-3.5") {
                pricing(usd(50, 2), usd(150, 2))
            } else {
                pricing(usd(250, 2), usd(10, 0))
            }
        }
        Provider::Anthropic => {
            if lower.contains("opus") {
                pricing(usd(15, 0), usd(75, 0))
            } else if lower.contains("haiku") {
                pricing(usd(80, 2), usd(4, 0))
            } else {
                pricing(usd(3, 0), usd(15, 0))
            }
        }
        Provider::Google => {
            if lower.contains("pro") {
                pricing(usd(125, 2), usd(5, 0))
            } else {
                pricing(usd(75, 3), usd(30, 2))
            }
        }
    }
}

/// Cost in USD of one call.
///
/// `(prompt * prompt_price + completion * completion_price) / 1_000_000`,
/// computed exactly.
pub fn calculate_cost(
    prompt_tokens: u32,
    completion_tokens: u32,
    pricing: &ModelPricing,
) -> BigDecimal {
    let per_mtok = BigDecimal::from(prompt_tokens) * &pricing.prompt_per_mtok
        + BigDecimal::from(completion_tokens) * &pricing.completion_per_mtok;
    (per_mtok / BigDecimal::from(1_000_000)).normalized()
}
