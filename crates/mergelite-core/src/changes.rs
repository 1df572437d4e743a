//! Change extraction: everything a peer has not pulled yet.
//!
//! Results are keyed on `local_db_version`, this replica's clock at the
//! moment each change was persisted locally. Column values are read from
//! the user table at query time, so a change carries the value as of the
//! extraction moment while keeping the originating LWW identity.

use mergelite_error::{MergeliteError, Result};
use mergelite_types::{Change, NodeId, RecordId, RecordIdKind, Value, Version};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::schema::{self, TrackedTable};

/// Collect changes with `local_db_version > since`, excluding originators
/// in `excluded`, at most `limit` entries (`0` = unbounded).
///
/// Versions fill before tombstones when the limit bites; the combined
/// result is sorted by `local_db_version` ascending either way.
pub(crate) fn changes_since(
    conn: &Connection,
    table: &TrackedTable,
    kind: RecordIdKind,
    since: Version,
    excluded: &[NodeId],
    limit: usize,
) -> Result<Vec<Change>> {
    // One read transaction so versions, user values, and tombstones are a
    // consistent snapshot.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| MergeliteError::execution("BEGIN", e))?;

    let mut changes = collect_versions(&tx, table, kind, since, excluded, limit)?;
    let remaining = if limit == 0 {
        0
    } else {
        limit.saturating_sub(changes.len())
    };
    if limit == 0 || remaining > 0 {
        changes.extend(collect_tombstones(
            &tx, table, kind, since, excluded, remaining,
        )?);
    }
    tx.commit()
        .map_err(|e| MergeliteError::execution("COMMIT", e))?;

    changes.sort_by_key(|c| c.local_db_version);
    Ok(changes)
}

fn cursor_clause(shadow_table: &str, excluded: &[NodeId]) -> String {
    let mut sql = format!("FROM \"{shadow_table}\" WHERE local_db_version > ?1");
    if !excluded.is_empty() {
        let placeholders = (0..excluded.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" AND node_id NOT IN ({placeholders})"));
    }
    sql.push_str(" ORDER BY local_db_version ASC");
    sql
}

fn cursor_params(since: Version, excluded: &[NodeId], limit: usize) -> Vec<Value> {
    let mut params: Vec<Value> = Vec::with_capacity(excluded.len() + 2);
    params.push(Value::Integer(schema::to_stored(since)));
    params.extend(
        excluded
            .iter()
            .map(|node| Value::Integer(schema::to_stored(*node))),
    );
    if limit > 0 {
        #[allow(clippy::cast_possible_wrap)]
        params.push(Value::Integer(limit as i64));
    }
    params
}

fn collect_versions(
    conn: &Connection,
    table: &TrackedTable,
    kind: RecordIdKind,
    since: Version,
    excluded: &[NodeId],
    limit: usize,
) -> Result<Vec<Change>> {
    let mut sql = format!(
        "SELECT record_id, column_name, column_version, db_version, node_id, local_db_version {}",
        cursor_clause(&table.shadow.versions, excluded)
    );
    if limit > 0 {
        sql.push_str(&format!(" LIMIT ?{}", excluded.len() + 2));
    }

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| MergeliteError::prepare(&sql, e))?;
    let rows = stmt
        .query_map(
            params_from_iter(cursor_params(since, excluded, limit)),
            |row| {
                Ok((
                    row.get::<_, Value>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .map_err(|e| MergeliteError::execution(&sql, e))?;

    let mut changes = Vec::new();
    for row in rows {
        let (raw_id, column, cv, dbv, node, ldv) =
            row.map_err(|e| MergeliteError::execution(&sql, e))?;
        let record_id = decode_record_id(&raw_id, kind)?;
        let value = current_value(conn, table, kind, &record_id, &column)?;
        changes.push(Change::column(
            record_id,
            column,
            value,
            schema::from_stored(cv),
            schema::from_stored(dbv),
            schema::from_stored(node),
            schema::from_stored(ldv),
        ));
    }
    Ok(changes)
}

fn collect_tombstones(
    conn: &Connection,
    table: &TrackedTable,
    kind: RecordIdKind,
    since: Version,
    excluded: &[NodeId],
    limit: usize,
) -> Result<Vec<Change>> {
    let mut sql = format!(
        "SELECT record_id, db_version, node_id, local_db_version {}",
        cursor_clause(&table.shadow.tombstones, excluded)
    );
    if limit > 0 {
        sql.push_str(&format!(" LIMIT ?{}", excluded.len() + 2));
    }

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| MergeliteError::prepare(&sql, e))?;
    let rows = stmt
        .query_map(
            params_from_iter(cursor_params(since, excluded, limit)),
            |row| {
                Ok((
                    row.get::<_, Value>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .map_err(|e| MergeliteError::execution(&sql, e))?;

    let mut changes = Vec::new();
    for row in rows {
        let (raw_id, dbv, node, ldv) = row.map_err(|e| MergeliteError::execution(&sql, e))?;
        let record_id = decode_record_id(&raw_id, kind)?;
        changes.push(Change::tombstone(
            record_id,
            schema::from_stored(dbv),
            schema::from_stored(node),
            schema::from_stored(ldv),
        ));
    }
    Ok(changes)
}

/// Read the column's value as of now. A missing row (tombstoned record)
/// and an explicit NULL both map to an absent value.
fn current_value(
    conn: &Connection,
    table: &TrackedTable,
    kind: RecordIdKind,
    record_id: &RecordId,
    column: &str,
) -> Result<Option<Value>> {
    let sql = format!(
        "SELECT \"{column}\" FROM \"{}\" WHERE {} = ?1",
        table.name,
        kind.id_column()
    );
    let value: Option<Value> = conn
        .query_row(&sql, params![record_id], |row| row.get(0))
        .optional()
        .map_err(|e| MergeliteError::execution(&sql, e))?;
    Ok(value.filter(|v| !v.is_null()))
}

fn decode_record_id(raw: &Value, kind: RecordIdKind) -> Result<RecordId> {
    RecordId::from_value(raw, kind).ok_or_else(|| {
        MergeliteError::internal(format!(
            "unexpected record-id shape in shadow table: {}",
            raw.type_name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drain;
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
        let table = TrackedTable {
            name: "users".to_owned(),
            columns: vec!["name".to_owned(), "email".to_owned()],
            shadow,
        };
        triggers::install(conn, &table, RecordIdKind::Integer).unwrap();
        table
    }

    fn write_and_promote(conn: &Connection, table: &TrackedTable, sql: &str, node: NodeId) {
        conn.execute(sql, []).unwrap();
        drain::promote(conn, table, node).unwrap();
    }

    #[test]
    fn extraction_orders_by_local_db_version() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);
        write_and_promote(
            &conn,
            &table,
            "INSERT INTO users (id, name, email) VALUES (1, 'Alice', 'alice@x')",
            1,
        );
        write_and_promote(&conn, &table, "DELETE FROM users WHERE id = 1", 1);

        let changes = changes_since(&conn, &table, RecordIdKind::Integer, 0, &[], 0).unwrap();
        assert_eq!(changes.len(), 3);
        assert!(changes.windows(2).all(|w| w[0].local_db_version <= w[1].local_db_version));
        assert!(changes[2].is_tombstone(), "tombstone promoted last");
    }

    #[test]
    fn cursor_excludes_already_pulled() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);
        write_and_promote(
            &conn,
            &table,
            "INSERT INTO users (id, name) VALUES (1, 'a')",
            1,
        );
        let clock = schema::read_clock(&conn, &table.shadow).unwrap();

        write_and_promote(
            &conn,
            &table,
            "UPDATE users SET name = 'b' WHERE id = 1",
            1,
        );
        let fresh = changes_since(&conn, &table, RecordIdKind::Integer, clock, &[], 0).unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].column_name.as_deref(), Some("name"));
        assert_eq!(fresh[0].column_version, 2);
    }

    #[test]
    fn node_exclusion_filters_originators() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);
        write_and_promote(
            &conn,
            &table,
            "INSERT INTO users (id, name) VALUES (1, 'a')",
            1,
        );

        let all = changes_since(&conn, &table, RecordIdKind::Integer, 0, &[], 0).unwrap();
        assert!(!all.is_empty());
        let none = changes_since(&conn, &table, RecordIdKind::Integer, 0, &[1], 0).unwrap();
        assert!(none.is_empty());
        let other = changes_since(&conn, &table, RecordIdKind::Integer, 0, &[2, 3], 0).unwrap();
        assert_eq!(other.len(), all.len());
    }

    #[test]
    fn limit_bounds_total_and_keeps_order() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);
        write_and_promote(
            &conn,
            &table,
            "INSERT INTO users (id, name, email) VALUES (1, 'a', 'a@x')",
            1,
        );
        write_and_promote(
            &conn,
            &table,
            "INSERT INTO users (id, name, email) VALUES (2, 'b', 'b@x')",
            1,
        );
        write_and_promote(&conn, &table, "DELETE FROM users WHERE id = 2", 1);

        let page = changes_since(&conn, &table, RecordIdKind::Integer, 0, &[], 3).unwrap();
        assert_eq!(page.len(), 3);
        assert!(page.windows(2).all(|w| w[0].local_db_version <= w[1].local_db_version));

        // Paginate the rest from the last cursor.
        let cursor = page[2].local_db_version;
        let rest = changes_since(&conn, &table, RecordIdKind::Integer, cursor, &[], 0).unwrap();
        assert_eq!(page.len() + rest.len(), 5);
        assert!(rest.iter().any(Change::is_tombstone));
    }

    #[test]
    fn values_read_at_extraction_time() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);
        write_and_promote(
            &conn,
            &table,
            "INSERT INTO users (id, name) VALUES (1, 'old')",
            1,
        );
        // Later local write replaces the value carried by the first change.
        write_and_promote(
            &conn,
            &table,
            "UPDATE users SET name = 'new' WHERE id = 1",
            1,
        );

        let changes = changes_since(&conn, &table, RecordIdKind::Integer, 0, &[], 0).unwrap();
        for change in changes.iter().filter(|c| c.column_name.as_deref() == Some("name")) {
            assert_eq!(change.value, Some(Value::from("new")));
        }
    }

    #[test]
    fn null_values_travel_as_absent() {
        let conn = Connection::open_in_memory().unwrap();
        let table = setup(&conn);
        write_and_promote(
            &conn,
            &table,
            "INSERT INTO users (id, name) VALUES (1, 'a')",
            1,
        );
        write_and_promote(
            &conn,
            &table,
            "UPDATE users SET name = NULL WHERE id = 1",
            1,
        );

        let changes = changes_since(&conn, &table, RecordIdKind::Integer, 0, &[], 0).unwrap();
        let name = changes
            .iter()
            .find(|c| c.column_name.as_deref() == Some("name"))
            .unwrap();
        assert_eq!(name.value, None);
    }
}
