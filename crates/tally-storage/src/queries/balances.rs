// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Balance row queries.
//!
//! Amounts are written as decimal text and parsed back with `BigDecimal`,
//! so no precision is lost on the way through SQLite.

use bigdecimal::BigDecimal;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tally_core::{Balance, Provider, TallyError, UserId};

use crate::database::{Database, map_tr_err};
use crate::models::{BalanceDefaults, decimal_at, provider_at};

const BALANCE_COLUMNS: &str = "id, user_id, provider, balance, currency, warning_threshold,
     threshold_crossed, credential, created_at, updated_at";

fn balance_from_row(row: &Row<'_>) -> rusqlite::Result<Balance> {
    Ok(Balance {
        id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        provider: provider_at(row, 2)?,
        balance: decimal_at(row, 3)?,
        currency: row.get(4)?,
        warning_threshold: decimal_at(row, 5)?,
        threshold_crossed: row.get(6)?,
        credential: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

/// Fetch the balance row for a pair, if it exists.
pub fn find(
    conn: &Connection,
    user_id: &UserId,
    provider: Provider,
) -> rusqlite::Result<Option<Balance>> {
    conn.query_row(
        &format!("SELECT {BALANCE_COLUMNS} FROM balances WHERE user_id = ?1 AND provider = ?2"),
        params![user_id.as_str(), provider.to_string()],
        balance_from_row,
    )
    .optional()
}

fn find_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Balance> {
    conn.query_row(
        &format!("SELECT {BALANCE_COLUMNS} FROM balances WHERE id = ?1"),
        params![id],
        balance_from_row,
    )
}

/// Return the balance row for a pair, creating it with `defaults` first.
///
/// The insert is `ON CONFLICT DO NOTHING`, so two writers racing on the
/// first use of a pair both end up reading the same single row.
pub fn ensure(
    conn: &Connection,
    user_id: &UserId,
    provider: Provider,
    defaults: &BalanceDefaults,
) -> rusqlite::Result<Balance> {
    conn.execute(
        "INSERT INTO balances (user_id, provider, balance, currency, warning_threshold)
         VALUES (?1, ?2, '0', ?3, ?4)
         ON CONFLICT (user_id, provider) DO NOTHING",
        params![
            user_id.as_str(),
            provider.to_string(),
            defaults.currency,
            defaults.threshold.to_string(),
        ],
    )?;
    find(conn, user_id, provider)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

/// Persist the mutable state of a balance and return the updated row.
pub fn save_state(
    conn: &Connection,
    id: i64,
    balance: &BigDecimal,
    warning_threshold: &BigDecimal,
    threshold_crossed: bool,
) -> rusqlite::Result<Balance> {
    conn.execute(
        "UPDATE balances SET balance = ?1, warning_threshold = ?2, threshold_crossed = ?3,
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE id = ?4",
        params![
            balance.to_string(),
            warning_threshold.to_string(),
            threshold_crossed,
            id
        ],
    )?;
    find_by_id(conn, id)
}

/// Store or clear the provider credential kept with a balance.
pub fn set_credential(
    conn: &Connection,
    id: i64,
    credential: Option<&str>,
) -> rusqlite::Result<Balance> {
    conn.execute(
        "UPDATE balances SET credential = ?1,
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE id = ?2",
        params![credential, id],
    )?;
    find_by_id(conn, id)
}

/// Number of rows for a pair. Used to check uniqueness under contention.
pub fn count_for_pair(
    conn: &Connection,
    user_id: &UserId,
    provider: Provider,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM balances WHERE user_id = ?1 AND provider = ?2",
        params![user_id.as_str(), provider.to_string()],
        |row| row.get(0),
    )
}

/// Every balance held by a user, ordered by provider.
pub async fn list_for_user(db: &Database, user_id: &UserId) -> Result<Vec<Balance>, TallyError> {
    let user_id = user_id.clone();
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BALANCE_COLUMNS} FROM balances WHERE user_id = ?1 ORDER BY provider ASC"
            ))?;
            let rows = stmt.query_map(params![user_id.as_str()], balance_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(map_tr_err)
}
