//! Applying remote changes under column-granularity last-writer-wins.
//!
//! Acceptance is strict: an incoming change must exceed the stored LWW key
//! lexicographically, so ties retain the local value. Accepted changes
//! write through to the user table while the replication triggers are
//! dropped (the caller holds the trigger guard), then record the *remote*
//! LWW identity in the metadata with a fresh local clock value.

use mergelite_error::{MergeliteError, Result};
use mergelite_types::{Change, RecordIdKind, Value};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, trace};

use crate::schema::{self, TrackedTable};

/// Resolve and apply a change sequence inside one transaction.
///
/// Returns the accepted subsequence so callers can acknowledge progress to
/// peers. Any error rolls the whole transaction back; the caller's trigger
/// guard handles restoration.
pub(crate) fn apply(
    conn: &Connection,
    table: &TrackedTable,
    kind: RecordIdKind,
    changes: &[Change],
) -> Result<Vec<Change>> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| MergeliteError::execution("BEGIN", e))?;

    let mut clock = schema::read_clock(&tx, &table.shadow)?;
    let read_tombstone = format!(
        "SELECT db_version, node_id FROM \"{}\" WHERE record_id = ?1",
        table.shadow.tombstones
    );
    let read_version = format!(
        "SELECT column_version, db_version, node_id FROM \"{}\" \
         WHERE record_id = ?1 AND column_name = ?2",
        table.shadow.versions
    );
    let upsert_version = table.shadow.upsert_version_sql();
    let upsert_tombstone = table.shadow.upsert_tombstone_sql();
    let delete_row = format!(
        "DELETE FROM \"{}\" WHERE {} = ?1",
        table.name,
        kind.id_column()
    );

    let mut accepted = Vec::new();
    for change in changes {
        if change.is_tombstone() {
            let existing: Option<(i64, i64)> = tx
                .query_row(&read_tombstone, params![change.record_id], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()
                .map_err(|e| MergeliteError::execution(&read_tombstone, e))?;
            let wins = existing.map_or(true, |(dbv, node)| {
                (change.db_version, change.node_id)
                    > (schema::from_stored(dbv), schema::from_stored(node))
            });
            if !wins {
                trace!(record = %change.record_id, "tombstone lost LWW, keeping local");
                continue;
            }

            clock = schema::next_version(clock)?;
            tx.execute(
                &upsert_tombstone,
                params![
                    change.record_id,
                    schema::to_stored(change.db_version),
                    schema::to_stored(change.node_id),
                    schema::to_stored(clock)
                ],
            )
            .map_err(|e| MergeliteError::execution(&upsert_tombstone, e))?;
            tx.execute(&delete_row, params![change.record_id])
                .map_err(|e| MergeliteError::execution(&delete_row, e))?;
            accepted.push(change.clone());
        } else {
            let Some(column) = change.column_name.as_deref() else {
                continue;
            };
            // Remote column names are interpolated into write-through SQL
            // and must exist in the introspected column list.
            if !table.columns.iter().any(|c| c == column) {
                return Err(MergeliteError::NoSuchColumn {
                    name: column.to_owned(),
                });
            }

            let existing: Option<(i64, i64, i64)> = tx
                .query_row(&read_version, params![change.record_id, column], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .optional()
                .map_err(|e| MergeliteError::execution(&read_version, e))?;
            let wins = existing.map_or(true, |(cv, dbv, node)| {
                change.lww_key()
                    > (
                        schema::from_stored(cv),
                        schema::from_stored(dbv),
                        schema::from_stored(node),
                    )
            });
            if !wins {
                trace!(record = %change.record_id, column, "column change lost LWW, keeping local");
                continue;
            }

            write_through(&tx, table, kind, change, column)?;
            clock = schema::next_version(clock)?;
            tx.execute(
                &upsert_version,
                params![
                    change.record_id,
                    column,
                    schema::to_stored(change.column_version),
                    schema::to_stored(change.db_version),
                    schema::to_stored(change.node_id),
                    schema::to_stored(clock)
                ],
            )
            .map_err(|e| MergeliteError::execution(&upsert_version, e))?;
            accepted.push(change.clone());
        }
    }

    schema::write_clock(&tx, &table.shadow, clock)?;
    tx.commit()
        .map_err(|e| MergeliteError::execution("COMMIT", e))?;

    debug!(
        table = %table.name,
        accepted = accepted.len(),
        offered = changes.len(),
        "merge applied"
    );
    Ok(accepted)
}

/// Write an accepted column change into the user table.
fn write_through(
    tx: &Transaction<'_>,
    table: &TrackedTable,
    kind: RecordIdKind,
    change: &Change,
    column: &str,
) -> Result<()> {
    let value = change.value.clone().unwrap_or(Value::Null);
    let update = format!(
        "UPDATE \"{}\" SET \"{column}\" = ?1 WHERE {} = ?2",
        table.name,
        kind.id_column()
    );
    let updated = tx
        .execute(&update, params![value, change.record_id])
        .map_err(|e| MergeliteError::execution(&update, e))?;
    if updated > 0 {
        return Ok(());
    }

    let insert = format!(
        "INSERT OR IGNORE INTO \"{}\" ({}, \"{column}\") VALUES (?1, ?2)",
        table.name,
        kind.id_column()
    );
    let inserted = tx
        .execute(&insert, params![change.record_id, value])
        .map_err(|e| MergeliteError::execution(&insert, e))?;
    if inserted == 0 {
        // The row appeared between the UPDATE and the INSERT attempt.
        tx.execute(&update, params![value, change.record_id])
            .map_err(|e| MergeliteError::execution(&update, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use mergelite_types::RecordId;

    use super::*;
    use crate::schema::ShadowNames;
    use crate::triggers;

    fn setup(conn: &Connection) -> TrackedTable {
        conn.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT)",
            [],
        )
        .unwrap();
        let shadow = ShadowNames::new("users");
        schema::install(conn, &shadow).unwrap();
        TrackedTable {
            name: "users".to_owned(),
            columns: vec!["name".to_owned(), "email".to_owned()],
            shadow,
        }
    }

    fn name_of(conn: &Connection, id: i64) -> Option<Option<String>> {
        conn.query_row("SELECT name FROM users WHERE id = ?1", [id], |r| r.get(0))
            .optional()
            .unwrap()
    }

    fn column_change(id: i64, column: &str, value: &str, cv: u64, dbv: u64, node: u64) -> Change {
        Change::column(
            RecordId::Int(id),
            column,
            Some(Value::from(value)),
            cv,
            dbv,
            node,
            0,
        )
    }

    #[test]
    fn fresh_change_is_accepted_and_written_through() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);

        let incoming = vec![column_change(1, "name", "Alice", 1, 1, 2)];
        let accepted = apply(&conn, &table, RecordIdKind::Integer, &incoming).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(name_of(&conn, 1), Some(Some("Alice".to_owned())));

        // Stored identity is the remote one; local_db_version is local.
        let (cv, dbv, node, ldv): (i64, i64, i64, i64) = conn
            .query_row(
                &format!(
                    "SELECT column_version, db_version, node_id, local_db_version \
                     FROM \"{}\" WHERE record_id = 1 AND column_name = 'name'",
                    table.shadow.versions
                ),
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!((cv, dbv, node), (1, 1, 2));
        assert_eq!(ldv, 1, "merge advanced the local clock");
    }

    #[test]
    fn lww_rejects_stale_and_ties() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);

        apply(
            &conn,
            &table,
            RecordIdKind::Integer,
            &[column_change(1, "name", "newer", 2, 5, 3)],
        )
        .unwrap();

        // Lower column version loses.
        let accepted = apply(
            &conn,
            &table,
            RecordIdKind::Integer,
            &[column_change(1, "name", "older", 1, 9, 9)],
        )
        .unwrap();
        assert!(accepted.is_empty());
        assert_eq!(name_of(&conn, 1), Some(Some("newer".to_owned())));

        // An identical key is a tie; ties retain the local value.
        let accepted = apply(
            &conn,
            &table,
            RecordIdKind::Integer,
            &[column_change(1, "name", "tied", 2, 5, 3)],
        )
        .unwrap();
        assert!(accepted.is_empty());
        assert_eq!(name_of(&conn, 1), Some(Some("newer".to_owned())));
    }

    #[test]
    fn merge_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);
        let incoming = vec![
            column_change(1, "name", "Alice", 1, 1, 2),
            column_change(1, "email", "alice@x", 1, 2, 2),
        ];

        let first = apply(&conn, &table, RecordIdKind::Integer, &incoming).unwrap();
        assert_eq!(first.len(), 2);
        let second = apply(&conn, &table, RecordIdKind::Integer, &incoming).unwrap();
        assert!(second.is_empty(), "duplicate merge must accept nothing");
    }

    #[test]
    fn sequential_effects_within_one_call() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);
        // The second change sees the first's metadata effect and loses.
        let incoming = vec![
            column_change(1, "name", "second", 2, 2, 1),
            column_change(1, "name", "first", 1, 1, 1),
        ];
        let accepted = apply(&conn, &table, RecordIdKind::Integer, &incoming).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(name_of(&conn, 1), Some(Some("second".to_owned())));
    }

    #[test]
    fn tombstone_deletes_user_row() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);
        apply(
            &conn,
            &table,
            RecordIdKind::Integer,
            &[column_change(1, "name", "Alice", 1, 1, 2)],
        )
        .unwrap();

        let tombstone = Change::tombstone(RecordId::Int(1), 3, 2, 0);
        let accepted = apply(&conn, &table, RecordIdKind::Integer, &[tombstone.clone()]).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(name_of(&conn, 1), None);

        // Replay of the same tombstone is not a strict win.
        let again = apply(&conn, &table, RecordIdKind::Integer, &[tombstone]).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn absent_value_writes_null() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);
        apply(
            &conn,
            &table,
            RecordIdKind::Integer,
            &[column_change(1, "name", "Alice", 1, 1, 2)],
        )
        .unwrap();

        let clear = Change::column(RecordId::Int(1), "name", None, 2, 2, 2, 0);
        apply(&conn, &table, RecordIdKind::Integer, &[clear]).unwrap();
        assert_eq!(name_of(&conn, 1), Some(None));
    }

    #[test]
    fn unknown_column_rolls_back() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);
        let incoming = vec![
            column_change(1, "name", "Alice", 1, 1, 2),
            column_change(1, "nickname", "Al", 1, 2, 2),
        ];
        let err = apply(&conn, &table, RecordIdKind::Integer, &incoming).unwrap_err();
        assert!(matches!(err, MergeliteError::NoSuchColumn { name } if name == "nickname"));

        // The accepted first change rolled back with the transaction.
        assert_eq!(name_of(&conn, 1), None);
        assert_eq!(schema::read_clock(&conn, &table.shadow).unwrap(), 0);
    }

    #[test]
    fn merge_advances_clock_once_per_accepted_change() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);
        let incoming = vec![
            column_change(1, "name", "a", 1, 1, 2),
            column_change(1, "email", "a@x", 1, 2, 2),
            Change::tombstone(RecordId::Int(9), 3, 2, 0),
        ];
        apply(&conn, &table, RecordIdKind::Integer, &incoming).unwrap();
        assert_eq!(schema::read_clock(&conn, &table.shadow).unwrap(), 3);

        // Distinct local_db_versions per accepted change (pagination safety).
        let ldvs: Vec<i64> = {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT local_db_version FROM \"{}\" ORDER BY local_db_version",
                    table.shadow.versions
                ))
                .unwrap();
            stmt.query_map([], |r| r.get(0))
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap()
        };
        assert_eq!(ldvs, vec![1, 2]);
    }

    #[test]
    fn triggers_stay_quiet_during_merge() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);
        triggers::install(&conn, &table, RecordIdKind::Integer).unwrap();
        triggers::drop_all(&conn, &table).unwrap();

        apply(
            &conn,
            &table,
            RecordIdKind::Integer,
            &[column_change(1, "name", "Alice", 1, 1, 2)],
        )
        .unwrap();

        let pending: i64 = conn
            .query_row(
                &format!("SELECT count(*) FROM \"{}\"", table.shadow.pending),
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(pending, 0, "merge writes must not enqueue pending tuples");
    }
}
