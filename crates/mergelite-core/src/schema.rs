//! Shadow-schema installation and table introspection.
//!
//! Every enabled user table owns five engine tables grouped under a fixed
//! name prefix: per-column version rows, record tombstones, the one-row
//! logical clock, the transient pending buffer the triggers write into, and
//! a cache of the introspected column types. All identifiers interpolated
//! into DDL come from the validated table name or from `PRAGMA table_info`;
//! nothing caller-supplied is spliced in unchecked.

use mergelite_error::{MergeliteError, Result, MAX_TABLE_NAME_LEN};
use mergelite_types::{RecordIdKind, Version};
use rusqlite::Connection;

/// Prefix grouping shadow tables with the user table they serve.
pub(crate) const SHADOW_PREFIX: &str = "crdt_";

/// Names of the five shadow tables and three triggers for one user table.
#[derive(Clone, Debug)]
pub(crate) struct ShadowNames {
    pub versions: String,
    pub tombstones: String,
    pub clock: String,
    pub pending: String,
    pub types: String,
    pub insert_trigger: String,
    pub update_trigger: String,
    pub delete_trigger: String,
}

impl ShadowNames {
    pub(crate) fn new(table: &str) -> Self {
        Self {
            versions: format!("{SHADOW_PREFIX}{table}_versions"),
            tombstones: format!("{SHADOW_PREFIX}{table}_tombstones"),
            clock: format!("{SHADOW_PREFIX}{table}_clock"),
            pending: format!("{SHADOW_PREFIX}{table}_pending"),
            types: format!("{SHADOW_PREFIX}{table}_types"),
            insert_trigger: format!("{SHADOW_PREFIX}{table}_ai"),
            update_trigger: format!("{SHADOW_PREFIX}{table}_au"),
            delete_trigger: format!("{SHADOW_PREFIX}{table}_bd"),
        }
    }

    /// Upsert statement for a versions row.
    pub(crate) fn upsert_version_sql(&self) -> String {
        format!(
            "INSERT INTO \"{}\" (record_id, column_name, column_version, db_version, node_id, local_db_version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (record_id, column_name) DO UPDATE SET \
             column_version = excluded.column_version, \
             db_version = excluded.db_version, \
             node_id = excluded.node_id, \
             local_db_version = excluded.local_db_version",
            self.versions
        )
    }

    /// Upsert statement for a tombstone row.
    pub(crate) fn upsert_tombstone_sql(&self) -> String {
        format!(
            "INSERT INTO \"{}\" (record_id, db_version, node_id, local_db_version) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (record_id) DO UPDATE SET \
             db_version = excluded.db_version, \
             node_id = excluded.node_id, \
             local_db_version = excluded.local_db_version",
            self.tombstones
        )
    }
}

/// One column as reported by `PRAGMA table_info`.
#[derive(Clone, Debug)]
pub(crate) struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub pk: i64,
}

/// The table a replica is currently tracking.
#[derive(Clone, Debug)]
pub(crate) struct TrackedTable {
    pub name: String,
    /// Replicated (non-key) columns, in introspection order.
    pub columns: Vec<String>,
    pub shadow: ShadowNames,
}

/// Execute a single statement, tagging errors with the statement text.
pub(crate) fn run(conn: &Connection, sql: &str) -> Result<()> {
    conn.execute(sql, [])
        .map(|_| ())
        .map_err(|e| MergeliteError::execution(sql, e))
}

/// Validate a user table name before it is interpolated anywhere.
pub(crate) fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(MergeliteError::InvalidTableName {
            name: name.to_owned(),
        });
    }
    if name.len() > MAX_TABLE_NAME_LEN {
        return Err(MergeliteError::TableNameTooLong {
            name: name.to_owned(),
            len: name.len(),
            max: MAX_TABLE_NAME_LEN,
        });
    }
    Ok(())
}

/// Read the column list of a user table.
///
/// The name must already be validated. Fails with `NoSuchTable` when the
/// table does not exist (`table_info` reports no columns).
pub(crate) fn introspect(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let sql = format!("PRAGMA table_info(\"{table}\")");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| MergeliteError::prepare(&sql, e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                decl_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                pk: row.get(5)?,
            })
        })
        .map_err(|e| MergeliteError::execution(&sql, e))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row.map_err(|e| MergeliteError::execution(&sql, e))?);
    }
    if columns.is_empty() {
        return Err(MergeliteError::NoSuchTable {
            name: table.to_owned(),
        });
    }
    Ok(columns)
}

/// Select the replicated columns for a table under the given id shape.
///
/// Key columns are never replicated: the record identifier travels in the
/// change itself. Composite primary keys and id-less tables in uuid mode
/// cannot be replicated at all.
pub(crate) fn tracked_columns(
    columns: &[ColumnInfo],
    kind: RecordIdKind,
    table: &str,
) -> Result<Vec<String>> {
    let key_count = columns.iter().filter(|c| c.pk > 0).count();
    if key_count > 1 {
        return Err(MergeliteError::UnsupportedSchema {
            table: table.to_owned(),
            detail: "composite primary key".to_owned(),
        });
    }
    if kind == RecordIdKind::Uuid && !columns.iter().any(|c| c.name == "id") {
        return Err(MergeliteError::UnsupportedSchema {
            table: table.to_owned(),
            detail: "uuid record ids require an `id` column".to_owned(),
        });
    }

    let tracked: Vec<String> = columns
        .iter()
        .filter(|c| c.pk == 0)
        .filter(|c| !(kind == RecordIdKind::Uuid && c.name == "id"))
        .map(|c| c.name.clone())
        .collect();
    if tracked.is_empty() {
        return Err(MergeliteError::UnsupportedSchema {
            table: table.to_owned(),
            detail: "no replicable columns".to_owned(),
        });
    }
    Ok(tracked)
}

/// Idempotently create the five shadow tables, their indices, and the
/// seeded clock row.
pub(crate) fn install(conn: &Connection, shadow: &ShadowNames) -> Result<()> {
    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\
             record_id NOT NULL, \
             column_name TEXT NOT NULL, \
             column_version INTEGER NOT NULL, \
             db_version INTEGER NOT NULL, \
             node_id INTEGER NOT NULL, \
             local_db_version INTEGER NOT NULL, \
             PRIMARY KEY (record_id, column_name))",
            shadow.versions
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{0}_ldv\" ON \"{0}\" (local_db_version)",
            shadow.versions
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\
             record_id NOT NULL PRIMARY KEY, \
             db_version INTEGER NOT NULL, \
             node_id INTEGER NOT NULL, \
             local_db_version INTEGER NOT NULL)",
            shadow.tombstones
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{0}_ldv\" ON \"{0}\" (local_db_version)",
            shadow.tombstones
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\
             id INTEGER PRIMARY KEY CHECK (id = 1), \
             time INTEGER NOT NULL)",
            shadow.clock
        ),
        format!(
            "INSERT OR IGNORE INTO \"{}\" (id, time) VALUES (1, 0)",
            shadow.clock
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\
             op INTEGER NOT NULL, \
             record_id NOT NULL, \
             column_name TEXT NOT NULL)",
            shadow.pending
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\
             column_name TEXT NOT NULL PRIMARY KEY, \
             type_tag TEXT NOT NULL)",
            shadow.types
        ),
    ];
    for sql in &statements {
        run(conn, sql)?;
    }
    Ok(())
}

/// Rewrite the types cache from a fresh introspection.
pub(crate) fn write_types_cache(
    conn: &Connection,
    shadow: &ShadowNames,
    columns: &[ColumnInfo],
) -> Result<()> {
    run(conn, &format!("DELETE FROM \"{}\"", shadow.types))?;
    let sql = format!(
        "INSERT INTO \"{}\" (column_name, type_tag) VALUES (?1, ?2)",
        shadow.types
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| MergeliteError::prepare(&sql, e))?;
    for column in columns {
        stmt.execute(rusqlite::params![
            column.name,
            column.decl_type.to_ascii_uppercase()
        ])
        .map_err(|e| MergeliteError::execution(&sql, e))?;
    }
    Ok(())
}

/// Read the logical clock.
pub(crate) fn read_clock(conn: &Connection, shadow: &ShadowNames) -> Result<Version> {
    let sql = format!("SELECT time FROM \"{}\" WHERE id = 1", shadow.clock);
    let stored: i64 = conn
        .query_row(&sql, [], |row| row.get(0))
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => MergeliteError::internal("clock row missing"),
            other => MergeliteError::execution(&sql, other),
        })?;
    Ok(from_stored(stored))
}

/// Persist the logical clock.
pub(crate) fn write_clock(conn: &Connection, shadow: &ShadowNames, value: Version) -> Result<()> {
    let sql = format!("UPDATE \"{}\" SET time = ?1 WHERE id = 1", shadow.clock);
    conn.execute(&sql, [to_stored(value)])
        .map(|_| ())
        .map_err(|e| MergeliteError::execution(&sql, e))
}

/// Advance a version counter, failing on overflow.
pub(crate) fn next_version(value: Version) -> Result<Version> {
    value.checked_add(1).ok_or(MergeliteError::ClockOverflow)
}

/// Bit-cast an unsigned counter for INTEGER storage.
#[allow(clippy::cast_possible_wrap)]
pub(crate) const fn to_stored(value: u64) -> i64 {
    value as i64
}

/// Recover an unsigned counter from INTEGER storage.
#[allow(clippy::cast_sign_loss)]
pub(crate) const fn from_stored(value: i64) -> u64 {
    value as u64
}
