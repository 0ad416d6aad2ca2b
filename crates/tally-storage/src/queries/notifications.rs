// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Low-balance notification queue.
//!
//! Rows move `pending -> processing -> sent`, or back to `pending` on a
//! failed delivery until `max_attempts` is reached, after which they are
//! parked as `failed`. A `processing` row carries a `locked_until` lease so
//! that a crashed dispatcher does not strand it.

use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};
use tally_core::{Balance, TallyError, UserId};

use crate::database::{Database, map_tr_err};
use crate::models::{NotificationEntry, NotificationStatus, decimal_at, provider_at, status_at};

const ENTRY_COLUMNS: &str = "id, user_id, provider, balance, threshold, currency, status,
     attempts, max_attempts, last_error, created_at, updated_at, locked_until, sent_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationEntry> {
    Ok(NotificationEntry {
        id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        provider: provider_at(row, 2)?,
        balance: decimal_at(row, 3)?,
        threshold: decimal_at(row, 4)?,
        currency: row.get(5)?,
        status: status_at(row, 6)?,
        attempts: row.get(7)?,
        max_attempts: row.get(8)?,
        last_error: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        locked_until: row.get(12)?,
        sent_at: row.get(13)?,
    })
}

/// Enqueue a pending notification describing `balance`. Returns the row id.
pub fn enqueue(conn: &Connection, balance: &Balance, max_attempts: u32) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO notifications (user_id, provider, balance, threshold, currency, max_attempts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            balance.user_id.as_str(),
            balance.provider.to_string(),
            balance.balance.to_string(),
            balance.warning_threshold.to_string(),
            balance.currency,
            max_attempts,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Claim the oldest pending notification with an id above `after`.
///
/// The row is marked `processing` with a lease of `lease` in a single
/// statement, so a concurrent claimer never gets the same row. Returns
/// `None` when nothing is pending.
pub async fn claim_next(
    db: &Database,
    after: i64,
    lease: Duration,
) -> Result<Option<NotificationEntry>, TallyError> {
    let modifier = lease_modifier(lease);
    db.connection()
        .call(move |conn| {
            conn.query_row(
                &format!(
                    "UPDATE notifications SET status = 'processing',
                     locked_until = strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ?1),
                     updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                     WHERE id = (
                         SELECT id FROM notifications
                         WHERE status = 'pending' AND id > ?2
                         ORDER BY id ASC
                         LIMIT 1
                     )
                     RETURNING {ENTRY_COLUMNS}"
                ),
                params![modifier, after],
                entry_from_row,
            )
            .optional()
        })
        .await
        .map_err(map_tr_err)
}

/// SQLite date modifier for `lease`, keeping millisecond precision.
fn lease_modifier(lease: Duration) -> String {
    format!("+{}.{:03} seconds", lease.as_secs(), lease.subsec_millis())
}

/// Return `processing` rows whose lease has expired to `pending`.
///
/// Returns the number of rows released.
pub async fn release_expired(db: &Database) -> Result<usize, TallyError> {
    db.connection()
        .call(|conn| {
            conn.execute(
                "UPDATE notifications SET status = 'pending', locked_until = NULL,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE status = 'processing'
                   AND locked_until < strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                [],
            )
        })
        .await
        .map_err(map_tr_err)
}

/// Mark a claimed notification as delivered.
///
/// Only applies while `entry`'s lease is still the one on the row. Returns
/// `false` when the lease was lost to another dispatcher.
pub async fn mark_sent(db: &Database, entry: &NotificationEntry) -> Result<bool, TallyError> {
    let id = entry.id;
    let lease = entry.locked_until.clone();
    db.connection()
        .call(move |conn| {
            let updated = conn.execute(
                "UPDATE notifications SET status = 'sent', attempts = attempts + 1,
                 locked_until = NULL, last_error = NULL,
                 sent_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?1 AND status = 'processing' AND locked_until IS ?2",
                params![id, lease],
            )?;
            Ok(updated == 1)
        })
        .await
        .map_err(map_tr_err)
}

/// Record a failed delivery attempt.
///
/// Increments `attempts` and stores `error`. The row goes back to `pending`
/// while attempts remain, otherwise it becomes `failed`. Returns the new
/// status, or `None` when `entry`'s lease was lost to another dispatcher.
pub async fn mark_failed(
    db: &Database,
    entry: &NotificationEntry,
    error: &str,
) -> Result<Option<NotificationStatus>, TallyError> {
    let id = entry.id;
    let lease = entry.locked_until.clone();
    let error = error.to_string();
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let held: Option<(u32, u32)> = tx
                .query_row(
                    "SELECT attempts, max_attempts FROM notifications
                     WHERE id = ?1 AND status = 'processing' AND locked_until IS ?2",
                    params![id, lease],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((attempts, max_attempts)) = held else {
                return Ok(None);
            };

            let new_attempts = attempts + 1;
            let status = if new_attempts >= max_attempts {
                NotificationStatus::Failed
            } else {
                NotificationStatus::Pending
            };
            tx.execute(
                "UPDATE notifications SET status = ?1, attempts = ?2, last_error = ?3,
                 locked_until = NULL,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?4",
                params![status.to_string(), new_attempts, error, id],
            )?;
            tx.commit()?;
            Ok(Some(status))
        })
        .await
        .map_err(map_tr_err)
}

/// Fetch one notification by id.
pub async fn get(db: &Database, id: i64) -> Result<Option<NotificationEntry>, TallyError> {
    db.connection()
        .call(move |conn| {
            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM notifications WHERE id = ?1"),
                params![id],
                entry_from_row,
            )
            .optional()
        })
        .await
        .map_err(map_tr_err)
}

/// Number of notifications in `status`.
pub async fn count_by_status(db: &Database, status: NotificationStatus) -> Result<u64, TallyError> {
    let status = status.to_string();
    db.connection()
        .call(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE status = ?1",
                params![status],
                |row| crate::models::count_at(row, 0),
            )
        })
        .await
        .map_err(map_tr_err)
}
