// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One-shot subcommands: `dispatch`, `record`, `credit`, `balance`, `usage`
//! and `config`.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tally_accounting::{BalanceLedger, NotificationOutcome, UsageEvent, UsageRecorder};
use tally_config::TallyConfig;
use tally_core::{Balance, Provider, TallyError, UserId};
use tally_dispatch::{ScheduledDispatcher, sink_from_config};
use tally_storage::{Database, UsageSummary};

/// Arguments of `tally record`.
#[derive(Debug, Clone)]
pub struct RecordArgs {
    pub user: String,
    pub provider: Provider,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Priced from the model table when absent.
    pub cost: Option<BigDecimal>,
    pub task: Option<String>,
}

async fn open_ledger(config: &TallyConfig) -> Result<BalanceLedger, TallyError> {
    let db = Database::from_config(&config.storage).await?;
    BalanceLedger::from_config(db, config)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), TallyError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| TallyError::Internal(format!("failed to serialize output: {e}")))?;
    println!("{rendered}");
    Ok(())
}

fn describe_outcome(outcome: &NotificationOutcome) -> String {
    match outcome {
        NotificationOutcome::None => String::new(),
        NotificationOutcome::Warned { notification_id } => {
            format!(" (low-balance notification #{notification_id} queued)")
        }
    }
}

/// `tally dispatch`: deliver one batch and report what happened.
pub async fn run_dispatch(config: &TallyConfig, json: bool) -> Result<(), TallyError> {
    let db = Database::from_config(&config.storage).await?;
    let sink = sink_from_config(&config.notify)?;
    let dispatcher = ScheduledDispatcher::from_config(db.clone(), sink, &config.dispatch);

    let report = dispatcher.dispatch_pending().await;
    if json {
        print_json(&report)?;
    } else {
        println!(
            "dispatched via {}: {} sent, {} retrying, {} dropped ({} claimed, {} released)",
            dispatcher.sink_name(),
            report.sent,
            report.retried,
            report.failed,
            report.claimed,
            report.released
        );
    }
    if report.storage_errors > 0 {
        return Err(TallyError::Internal(format!(
            "{} storage errors during dispatch; see log",
            report.storage_errors
        )));
    }
    Ok(())
}

/// `tally record`: record one usage event.
pub async fn run_record(
    config: &TallyConfig,
    args: RecordArgs,
    json: bool,
) -> Result<(), TallyError> {
    let recorder = UsageRecorder::new(open_ledger(config).await?);
    let mut event = UsageEvent::new(args.user, args.provider, args.model)
        .tokens(args.prompt_tokens, args.completion_tokens);
    if let Some(task) = args.task {
        event = event.task(task);
    }

    let receipt = match args.cost {
        Some(cost) => recorder.record(&event, cost).await?,
        None => recorder.record_priced(&event).await?,
    };

    if json {
        print_json(&receipt)?;
    } else {
        println!(
            "recorded {} ({} tokens, cost {}); {} balance now {} {}{}",
            receipt.record.id,
            receipt.record.total_tokens,
            receipt.record.cost,
            receipt.balance.provider,
            receipt.balance.balance,
            receipt.balance.currency,
            describe_outcome(&receipt.notification)
        );
    }
    Ok(())
}

/// `tally credit`: top up a balance.
pub async fn run_credit(
    config: &TallyConfig,
    user: &str,
    provider: Provider,
    amount: &BigDecimal,
    json: bool,
) -> Result<(), TallyError> {
    let ledger = open_ledger(config).await?;
    let change = ledger.credit(&UserId::from(user), provider, amount).await?;
    if json {
        print_json(&change)?;
    } else {
        println!(
            "credited {amount}; {provider} balance for {user} now {} {}{}",
            change.balance.balance,
            change.balance.currency,
            describe_outcome(&change.notification)
        );
    }
    Ok(())
}

/// `tally balance`: list a user's balances.
pub async fn run_balance(config: &TallyConfig, user: &str, json: bool) -> Result<(), TallyError> {
    let ledger = open_ledger(config).await?;
    let balances = ledger.list_for_user(&UserId::from(user)).await?;
    if json {
        return print_json(&balances);
    }
    if balances.is_empty() {
        println!("no balances for {user}");
        return Ok(());
    }
    print!("{}", format_balances(&balances));
    Ok(())
}

fn format_balances(balances: &[Balance]) -> String {
    let mut out = format!(
        "{:<10} {:>14} {:<4} {:>12}  {}\n",
        "PROVIDER", "BALANCE", "CUR", "THRESHOLD", "STATE"
    );
    for b in balances {
        let state = if b.threshold_crossed { "low" } else { "ok" };
        out.push_str(&format!(
            "{:<10} {:>14} {:<4} {:>12}  {}\n",
            b.provider.to_string(),
            b.balance.to_string(),
            b.currency,
            b.warning_threshold.to_string(),
            state
        ));
    }
    out
}

/// `tally usage`: usage summary for a user.
pub async fn run_usage(
    config: &TallyConfig,
    user: &str,
    provider: Option<Provider>,
    since: Option<DateTime<Utc>>,
    json: bool,
) -> Result<(), TallyError> {
    let recorder = UsageRecorder::new(open_ledger(config).await?);
    let summary = recorder
        .summary(&UserId::from(user), provider, since)
        .await?;
    if json {
        return print_json(&summary);
    }
    print!("{}", format_summary(&summary));
    Ok(())
}

fn format_summary(summary: &UsageSummary) -> String {
    let mut out = format!(
        "{:<10} {:>8} {:>12} {:>12} {:>12} {:>14}\n",
        "PROVIDER", "CALLS", "PROMPT", "COMPLETION", "TOTAL", "COST"
    );
    for p in &summary.providers {
        out.push_str(&format!(
            "{:<10} {:>8} {:>12} {:>12} {:>12} {:>14}\n",
            p.provider.to_string(),
            p.calls,
            p.prompt_tokens,
            p.completion_tokens,
            p.total_tokens,
            p.cost.to_string()
        ));
    }
    out.push_str(&format!(
        "{:<10} {:>8} {:>12} {:>12} {:>12} {:>14}\n",
        "all",
        summary.total_calls(),
        "",
        "",
        summary.total_tokens(),
        summary.total_cost().to_string()
    ));
    out
}

/// `tally config`: print the effective configuration as TOML.
pub fn run_config(config: &TallyConfig) -> Result<(), TallyError> {
    let rendered = toml::to_string_pretty(config)
        .map_err(|e| TallyError::Internal(format!("failed to render config: {e}")))?;
    print!("{rendered}");
    Ok(())
}
