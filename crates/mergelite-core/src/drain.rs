//! Post-commit promotion of the pending buffer.
//!
//! The triggers leave only terse `(op, record_id, column)` tuples behind;
//! this pipeline turns them into versioned metadata once the user
//! transaction has committed and its locks are gone. Each promoted tuple
//! advances the logical clock by one, so every change gets a distinct
//! `local_db_version` for cursor-based extraction.

use std::cell::Cell;

use mergelite_error::{MergeliteError, Result};
use mergelite_types::{ChangeOp, NodeId, Value};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::schema::{self, TrackedTable};

/// Scope-bound re-entry guard for the drain.
///
/// The drain's own commits re-fire the commit hook; the guard makes the
/// invariant "a drain never enqueues another drain" hold on every exit
/// path, including errors.
pub(crate) struct DrainGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> DrainGuard<'a> {
    pub(crate) fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self { flag }
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// Promote every pending tuple, in insertion order, inside one transaction.
///
/// Returns the number of promoted tuples. Promotion only runs in
/// autocommit mode: inside an open user transaction nothing has committed
/// yet, and the eventual COMMIT re-arms the drain. An empty buffer is
/// detected with a probe before any transaction opens, so the common
/// nothing-to-do case (the commit hook fires for every transaction on the
/// connection, including ones that never touched the tracked table) costs
/// one read.
pub(crate) fn promote(conn: &Connection, table: &TrackedTable, node_id: NodeId) -> Result<usize> {
    if !conn.is_autocommit() {
        return Ok(0);
    }
    let probe = format!("SELECT EXISTS (SELECT 1 FROM \"{}\")", table.shadow.pending);
    let has_backlog: bool = conn
        .query_row(&probe, [], |row| row.get(0))
        .map_err(|e| MergeliteError::execution(&probe, e))?;
    if !has_backlog {
        return Ok(0);
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| MergeliteError::execution("BEGIN", e))?;

    let select = format!(
        "SELECT op, record_id, column_name FROM \"{}\" ORDER BY rowid",
        table.shadow.pending
    );
    let pending: Vec<(i64, Value, String)> = {
        let mut stmt = tx
            .prepare(&select)
            .map_err(|e| MergeliteError::prepare(&select, e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(|e| MergeliteError::execution(&select, e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| MergeliteError::execution(&select, e))?);
        }
        out
    };

    let mut clock = schema::read_clock(&tx, &table.shadow)?;
    let read_version = format!(
        "SELECT column_version FROM \"{}\" WHERE record_id = ?1 AND column_name = ?2",
        table.shadow.versions
    );
    let upsert_version = table.shadow.upsert_version_sql();
    let upsert_tombstone = table.shadow.upsert_tombstone_sql();

    for (code, record_id, column) in &pending {
        let op = ChangeOp::from_code(*code)
            .ok_or_else(|| MergeliteError::internal(format!("unknown pending op code {code}")))?;
        match op {
            ChangeOp::Delete => {
                clock = schema::next_version(clock)?;
                tx.execute(
                    &upsert_tombstone,
                    params![
                        record_id,
                        schema::to_stored(clock),
                        schema::to_stored(node_id),
                        schema::to_stored(clock)
                    ],
                )
                .map_err(|e| MergeliteError::execution(&upsert_tombstone, e))?;
            }
            ChangeOp::Insert | ChangeOp::Update => {
                let prior: Option<i64> = tx
                    .query_row(&read_version, params![record_id, column], |row| row.get(0))
                    .optional()
                    .map_err(|e| MergeliteError::execution(&read_version, e))?;
                let column_version =
                    schema::next_version(schema::from_stored(prior.unwrap_or(0)))?;
                clock = schema::next_version(clock)?;
                tx.execute(
                    &upsert_version,
                    params![
                        record_id,
                        column,
                        schema::to_stored(column_version),
                        schema::to_stored(clock),
                        schema::to_stored(node_id),
                        schema::to_stored(clock)
                    ],
                )
                .map_err(|e| MergeliteError::execution(&upsert_version, e))?;
            }
        }
    }

    let truncate = format!("DELETE FROM \"{}\"", table.shadow.pending);
    tx.execute(&truncate, [])
        .map_err(|e| MergeliteError::execution(&truncate, e))?;
    schema::write_clock(&tx, &table.shadow, clock)?;
    tx.commit()
        .map_err(|e| MergeliteError::execution("COMMIT", e))?;

    debug!(table = %table.name, promoted = pending.len(), clock, "pending buffer promoted");
    Ok(pending.len())
}

/// Discard the pending buffer after a rolled-back transaction.
///
/// The rollback already unwound the in-transaction appends; this clears
/// anything that survives (e.g. tuples from a savepoint released before
/// the outer rollback).
pub(crate) fn purge(conn: &Connection, table: &TrackedTable) -> Result<usize> {
    let sql = format!("DELETE FROM \"{}\"", table.shadow.pending);
    let purged = conn
        .execute(&sql, [])
        .map_err(|e| MergeliteError::execution(&sql, e))?;
    if purged > 0 {
        debug!(table = %table.name, purged, "pending buffer purged after rollback");
    }
    Ok(purged)
}
