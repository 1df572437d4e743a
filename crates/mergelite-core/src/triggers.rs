//! Trigger generation for the in-transaction capture phase.
//!
//! The three triggers do the only metadata work performed while write locks
//! are held: one terse append to the pending buffer per changed column (or
//! one per deleted row). Everything else happens after commit, in the drain
//! pipeline.

use mergelite_error::Result;
use mergelite_types::{ChangeOp, RecordIdKind};
use rusqlite::Connection;
use tracing::{debug, error};

use crate::schema::{run, TrackedTable};

/// Render the three `CREATE TRIGGER` statements for a tracked table.
///
/// Only the validated table name and introspected column names are
/// interpolated. `IS NOT` in the update guard distinguishes NULL from
/// non-NULL transitions correctly.
pub(crate) fn trigger_sql(table: &TrackedTable, kind: RecordIdKind) -> [String; 3] {
    let id = kind.id_column();
    let pending = &table.shadow.pending;

    let mut insert_body = String::new();
    let mut update_body = String::new();
    for column in &table.columns {
        insert_body.push_str(&format!(
            "    INSERT INTO \"{pending}\" (op, record_id, column_name) \
             VALUES ({}, new.{id}, '{column}');\n",
            ChangeOp::Insert.code()
        ));
        update_body.push_str(&format!(
            "    INSERT INTO \"{pending}\" (op, record_id, column_name) \
             SELECT {}, new.{id}, '{column}' WHERE old.\"{column}\" IS NOT new.\"{column}\";\n",
            ChangeOp::Update.code()
        ));
    }
    let delete_body = format!(
        "    INSERT INTO \"{pending}\" (op, record_id, column_name) \
         VALUES ({}, old.{id}, '');\n",
        ChangeOp::Delete.code()
    );

    [
        format!(
            "CREATE TRIGGER \"{}\" AFTER INSERT ON \"{}\"\nBEGIN\n{}END",
            table.shadow.insert_trigger, table.name, insert_body
        ),
        format!(
            "CREATE TRIGGER \"{}\" AFTER UPDATE ON \"{}\"\nBEGIN\n{}END",
            table.shadow.update_trigger, table.name, update_body
        ),
        format!(
            "CREATE TRIGGER \"{}\" BEFORE DELETE ON \"{}\"\nBEGIN\n{}END",
            table.shadow.delete_trigger, table.name, delete_body
        ),
    ]
}

/// Install the triggers at enable time.
///
/// Stale triggers from a previous process are dropped first so the bodies
/// always reflect the current column list.
pub(crate) fn install(conn: &Connection, table: &TrackedTable, kind: RecordIdKind) -> Result<()> {
    for name in trigger_names(table) {
        run(conn, &format!("DROP TRIGGER IF EXISTS \"{name}\""))?;
    }
    for sql in trigger_sql(table, kind) {
        run(conn, &sql)?;
    }
    debug!(table = %table.name, "replication triggers installed");
    Ok(())
}

/// Drop and recreate the triggers after a schema change.
///
/// Plain `DROP`/`CREATE` (no `IF EXISTS` forms): a trigger that is
/// unexpectedly missing or present indicates corrupted tracking and must
/// surface as an error instead of being papered over.
pub(crate) fn reinstall(conn: &Connection, table: &TrackedTable, kind: RecordIdKind) -> Result<()> {
    drop_all(conn, table)?;
    for sql in trigger_sql(table, kind) {
        run(conn, &sql)?;
    }
    debug!(table = %table.name, "replication triggers reinstalled");
    Ok(())
}

/// Drop the three triggers (merge entry). They must exist.
pub(crate) fn drop_all(conn: &Connection, table: &TrackedTable) -> Result<()> {
    for name in trigger_names(table) {
        run(conn, &format!("DROP TRIGGER \"{name}\""))?;
    }
    Ok(())
}

fn trigger_names(table: &TrackedTable) -> [&str; 3] {
    [
        &table.shadow.insert_trigger,
        &table.shadow.update_trigger,
        &table.shadow.delete_trigger,
    ]
}

/// Restores the replication triggers on every merge exit path.
///
/// The happy path calls [`TriggerGuard::restore`] so a failure can be
/// returned to the caller; the `Drop` impl covers early returns and panics.
/// A restoration failure corrupts future tracking, so it is always logged
/// at error level even when it cannot be returned.
pub(crate) struct TriggerGuard<'conn> {
    conn: &'conn Connection,
    table: String,
    create: [String; 3],
    restored: bool,
}

impl<'conn> TriggerGuard<'conn> {
    pub(crate) fn new(conn: &'conn Connection, table: &TrackedTable, kind: RecordIdKind) -> Self {
        Self {
            conn,
            table: table.name.clone(),
            create: trigger_sql(table, kind),
            restored: false,
        }
    }

    pub(crate) fn restore(&mut self) -> Result<()> {
        self.restored = true;
        for sql in &self.create {
            if let Err(err) = run(self.conn, sql) {
                error!(table = %self.table, %err, "failed to restore replication triggers");
                return Err(err);
            }
        }
        debug!(table = %self.table, "replication triggers restored");
        Ok(())
    }
}

impl Drop for TriggerGuard<'_> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        for sql in &self.create {
            if let Err(err) = run(self.conn, sql) {
                error!(table = %self.table, %err, "failed to restore replication triggers");
            }
        }
    }
}
