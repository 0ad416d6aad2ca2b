// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Append-only usage record queries.

use rusqlite::{Connection, Row, params};
use tally_core::{Provider, TallyError, UsageRecord, UserId};

use crate::database::{Database, map_tr_err};
use crate::models::{NewUsageRecord, UsageSummary, count_at, decimal_at, provider_at};

const RECORD_COLUMNS: &str = "id, user_id, provider, model_name, prompt_tokens, completion_tokens,
     total_tokens, cost, created_at, related_task_id";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<UsageRecord> {
    Ok(UsageRecord {
        id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        provider: provider_at(row, 2)?,
        model_name: row.get(3)?,
        prompt_tokens: row.get(4)?,
        completion_tokens: row.get(5)?,
        total_tokens: count_at(row, 6)?,
        cost: decimal_at(row, 7)?,
        created_at: row.get(8)?,
        related_task_id: row.get(9)?,
    })
}

/// Insert a usage record and return it as stored.
pub fn insert_record(conn: &Connection, record: &NewUsageRecord) -> rusqlite::Result<UsageRecord> {
    let total_tokens = i64::from(record.prompt_tokens) + i64::from(record.completion_tokens);
    conn.execute(
        "INSERT INTO usage_records (id, user_id, provider, model_name, prompt_tokens,
                                    completion_tokens, total_tokens, cost, related_task_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.id,
            record.user_id.as_str(),
            record.provider.to_string(),
            record.model_name,
            record.prompt_tokens,
            record.completion_tokens,
            total_tokens,
            record.cost.to_string(),
            record.related_task_id,
        ],
    )?;
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM usage_records WHERE id = ?1"),
        params![record.id],
        record_from_row,
    )
}

/// Records made on behalf of one background task, oldest first.
pub async fn list_for_task(db: &Database, task_id: &str) -> Result<Vec<UsageRecord>, TallyError> {
    let task_id = task_id.to_string();
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM usage_records
                 WHERE related_task_id = ?1
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![task_id], record_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(map_tr_err)
}

/// Aggregate a user's usage per provider.
///
/// `since` is an ISO 8601 timestamp compared against `created_at`. Costs are
/// summed as decimals in Rust; SQLite would sum the TEXT column as floats.
pub async fn summarize(
    db: &Database,
    user_id: &UserId,
    provider: Option<Provider>,
    since: Option<&str>,
) -> Result<UsageSummary, TallyError> {
    let user_id = user_id.clone();
    let provider = provider.map(|p| p.to_string());
    let since = since.map(str::to_string);
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT provider, prompt_tokens, completion_tokens, cost
                 FROM usage_records
                 WHERE user_id = ?1
                   AND (?2 IS NULL OR provider = ?2)
                   AND (?3 IS NULL OR created_at >= ?3)
                 ORDER BY created_at ASC",
            )?;
            let mut rows = stmt.query(params![user_id.as_str(), provider, since])?;

            let mut summary = UsageSummary::new(user_id.clone());
            while let Some(row) = rows.next()? {
                let provider = provider_at(row, 0)?;
                let prompt = count_at(row, 1)?;
                let completion = count_at(row, 2)?;
                let cost = decimal_at(row, 3)?;
                summary.add(provider, prompt, completion, &cost);
            }
            Ok(summary)
        })
        .await
        .map_err(map_tr_err)
}
