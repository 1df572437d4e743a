//! The replica engine: one database file, one node id, one tracked table.
//!
//! A `Replica` owns its `rusqlite::Connection` and is single-threaded by
//! design: interior state lives in `Cell`/`RefCell` and the type is not
//! `Sync`. The only state shared across the C callback boundary is the
//! atomic flag block the hooks latch into.
//!
//! Every caller-facing method consults the pending-error latch at entry:
//! failures inside the deferred drain cannot be raised from the commit
//! path, so they are stored and reported on the next call.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mergelite_error::{MergeliteError, Result, MAX_EXCLUDED_NODES};
use mergelite_types::{Change, NodeId, RecordIdKind, Value, Version};
use rusqlite::{params_from_iter, Connection};
use tracing::{debug, info, warn};

use crate::changes;
use crate::drain::{self, DrainGuard};
use crate::hooks::{self, HookFlags};
use crate::merge;
use crate::schema::{self, TrackedTable};
use crate::triggers::{self, TriggerGuard};

/// Construction-time options beyond path and node id.
#[derive(Clone, Debug)]
pub struct ReplicaConfig {
    /// Shape of record identifiers for every table this instance enables.
    pub record_ids: RecordIdKind,
    /// Busy timeout applied to the connection.
    pub busy_timeout: Duration,
    /// Whether to enable foreign-key enforcement.
    pub foreign_keys: bool,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            record_ids: RecordIdKind::Integer,
            busy_timeout: Duration::from_secs(5),
            foreign_keys: true,
        }
    }
}

/// A replication-enabled database connection.
pub struct Replica {
    conn: Connection,
    node_id: NodeId,
    id_kind: RecordIdKind,
    flags: Arc<HookFlags>,
    tracked: RefCell<Option<TrackedTable>>,
    in_drain: Cell<bool>,
    latched: RefCell<Option<MergeliteError>>,
    poisoned: Cell<bool>,
}

impl Replica {
    /// Open (or create) a database with integer record ids.
    pub fn open(path: impl AsRef<Path>, node_id: NodeId) -> Result<Self> {
        Self::open_with(path, node_id, ReplicaConfig::default())
    }

    /// Open (or create) a database with explicit options.
    ///
    /// Enables foreign keys, switches the journal to WAL, and registers the
    /// commit, rollback, and authorizer callbacks. Any failure after the
    /// open drops the connection.
    pub fn open_with(
        path: impl AsRef<Path>,
        node_id: NodeId,
        config: ReplicaConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| MergeliteError::OpenFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        let replica = Self {
            conn,
            node_id,
            id_kind: config.record_ids,
            flags: Arc::new(HookFlags::default()),
            tracked: RefCell::new(None),
            in_drain: Cell::new(false),
            latched: RefCell::new(None),
            poisoned: Cell::new(false),
        };
        replica.configure(&config)?;
        hooks::register(&replica.conn, &replica.flags);
        info!(node_id, path = %path.display(), "replica opened");
        Ok(replica)
    }

    fn configure(&self, config: &ReplicaConfig) -> Result<()> {
        self.conn
            .busy_timeout(config.busy_timeout)
            .map_err(|e| MergeliteError::execution("PRAGMA busy_timeout", e))?;
        if config.foreign_keys {
            self.conn
                .pragma_update(None, "foreign_keys", "ON")
                .map_err(|e| MergeliteError::execution("PRAGMA foreign_keys = ON", e))?;
        }
        // In-memory databases report "memory" here; anything on disk
        // switches to WAL.
        let mode: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| MergeliteError::execution("PRAGMA journal_mode = WAL", e))?;
        debug!(%mode, "journal mode configured");
        Ok(())
    }

    /// The node identifier fixed at construction.
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The record-id shape fixed at construction.
    pub const fn record_id_kind(&self) -> RecordIdKind {
        self.id_kind
    }

    /// Name of the table currently enabled for replication, if any.
    pub fn tracked_table(&self) -> Option<String> {
        self.tracked.borrow().as_ref().map(|t| t.name.clone())
    }

    /// Enable replication on a user table.
    ///
    /// Installs the five shadow tables and three triggers. Idempotent for
    /// the already-enabled table; fails if a *different* table is already
    /// enabled on this instance, if the name is invalid or too long, or if
    /// the table is absent or has an unreplicable shape.
    pub fn enable(&self, table: &str) -> Result<()> {
        self.check_entry()?;
        schema::validate_table_name(table)?;
        if let Some(current) = self.tracked.borrow().as_ref() {
            if current.name != table {
                return Err(MergeliteError::AlreadyTracking {
                    table: current.name.clone(),
                });
            }
        }

        let columns = schema::introspect(&self.conn, table)?;
        let tracked_cols = schema::tracked_columns(&columns, self.id_kind, table)?;
        let shadow = schema::ShadowNames::new(table);
        schema::install(&self.conn, &shadow)?;
        schema::write_types_cache(&self.conn, &shadow, &columns)?;
        let tracked = TrackedTable {
            name: table.to_owned(),
            columns: tracked_cols,
            shadow,
        };
        triggers::install(&self.conn, &tracked, self.id_kind)?;
        self.flags.set_tracked(Some(table));
        *self.tracked.borrow_mut() = Some(tracked);
        // The shadow DDL commits re-fired the commit hook; no user data
        // was involved, so a later statement must not drain on its behalf.
        self.flags.take_commit();
        info!(table, "replication enabled");
        Ok(())
    }

    /// Execute a single statement that returns no rows.
    ///
    /// Returns the affected row count. Queries go through [`Self::prepare`].
    /// If the authorizer observed `ALTER TABLE` on the tracked table, the
    /// schema is refreshed before this returns.
    pub fn execute(&self, sql: &str) -> Result<usize> {
        self.check_entry()?;
        let count = self
            .conn
            .execute(sql, [])
            .map_err(|e| MergeliteError::execution(sql, e))?;
        self.after_statement()?;
        Ok(count)
    }

    /// Execute a batch of semicolon-separated statements.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.check_entry()?;
        self.conn
            .execute_batch(sql)
            .map_err(|e| MergeliteError::execution(sql, e))?;
        self.after_statement()
    }

    /// Prepare a statement for repeated execution.
    ///
    /// Writes through prepared statements are tracked like any other: the
    /// triggers fire on row mutation regardless of the statement vehicle.
    pub fn prepare(&self, sql: &str) -> Result<PreparedStatement<'_>> {
        self.check_entry()?;
        let stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| MergeliteError::prepare(sql, e))?;
        Ok(PreparedStatement {
            stmt,
            replica: self,
            sql: sql.to_owned(),
        })
    }

    /// Current logical clock of the enabled table.
    pub fn clock(&self) -> Result<Version> {
        self.check_entry()?;
        let tracked = self.tracked.borrow();
        let table = tracked.as_ref().ok_or(MergeliteError::NoTrackedTable)?;
        schema::read_clock(&self.conn, &table.shadow)
    }

    /// Number of live tombstone rows.
    pub fn tombstone_count(&self) -> Result<u64> {
        self.check_entry()?;
        let tracked = self.tracked.borrow();
        let table = tracked.as_ref().ok_or(MergeliteError::NoTrackedTable)?;
        let sql = format!("SELECT count(*) FROM \"{}\"", table.shadow.tombstones);
        let count: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| MergeliteError::execution(&sql, e))?;
        Ok(schema::from_stored(count))
    }

    /// Every change persisted locally after `since`, excluding the given
    /// originators, bounded to `limit` entries (`0` = unbounded).
    pub fn changes_since(
        &self,
        since: Version,
        excluded: &[NodeId],
        limit: usize,
    ) -> Result<Vec<Change>> {
        self.check_entry()?;
        if excluded.len() > MAX_EXCLUDED_NODES {
            return Err(MergeliteError::TooManyExcludedNodes {
                count: excluded.len(),
                max: MAX_EXCLUDED_NODES,
            });
        }
        let tracked = self.tracked.borrow();
        let table = tracked.as_ref().ok_or(MergeliteError::NoTrackedTable)?;
        changes::changes_since(&self.conn, table, self.id_kind, since, excluded, limit)
    }

    /// Merge remote changes, returning the accepted subsequence.
    ///
    /// The replication triggers are dropped for the duration and restored
    /// on every exit path; the metadata transaction rolls back on error.
    pub fn merge(&self, incoming: &[Change]) -> Result<Vec<Change>> {
        self.check_entry()?;
        let tracked = self.tracked.borrow();
        let table = tracked.as_ref().ok_or(MergeliteError::NoTrackedTable)?;

        triggers::drop_all(&self.conn, table)?;
        let mut guard = TriggerGuard::new(&self.conn, table, self.id_kind);
        let outcome = merge::apply(&self.conn, table, self.id_kind, incoming);
        let restored = guard.restore();
        // Merge's internal commit (or rollback) and the trigger DDL
        // re-fired the hooks; none of it is a user event.
        self.flags.take_commit();
        self.flags.take_rollback();
        match (outcome, restored) {
            (Ok(accepted), Ok(())) => Ok(accepted),
            // Merge failures win; a restore failure was already logged.
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
        }
    }

    /// Delete tombstones older than the acknowledgement watermark.
    ///
    /// The caller must pass the minimum `db_version` acknowledged by every
    /// peer; compacting past a lagging peer lets deleted records resurrect.
    pub fn compact(&self, watermark: Version) -> Result<usize> {
        self.check_entry()?;
        let tracked = self.tracked.borrow();
        let table = tracked.as_ref().ok_or(MergeliteError::NoTrackedTable)?;
        let sql = format!(
            "DELETE FROM \"{}\" WHERE db_version < ?1",
            table.shadow.tombstones
        );
        let removed = self
            .conn
            .execute(&sql, [schema::to_stored(watermark)])
            .map_err(|e| MergeliteError::execution(&sql, e))?;
        info!(table = %table.name, removed, watermark, "tombstones compacted");
        Ok(removed)
    }

    /// Re-introspect the tracked table and reinstall the triggers.
    ///
    /// Runs automatically after an observed `ALTER TABLE`; callable
    /// manually when statements bypassed [`Self::execute`].
    pub fn refresh_schema(&self) -> Result<()> {
        self.check_entry()?;
        if self.tracked.borrow().is_none() {
            return Err(MergeliteError::NoTrackedTable);
        }
        self.refresh_tracked()
    }

    /// Report a latched drain error, then the poison state.
    fn check_entry(&self) -> Result<()> {
        if let Some(err) = self.latched.borrow_mut().take() {
            return Err(err);
        }
        if self.poisoned.get() {
            return Err(MergeliteError::ClockOverflow);
        }
        Ok(())
    }

    fn latch(&self, err: MergeliteError) {
        if err.is_fatal() {
            self.poisoned.set(true);
        }
        let mut slot = self.latched.borrow_mut();
        // Keep the earliest unreported error.
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Consume hook latches after a caller-facing statement completed.
    fn after_statement(&self) -> Result<()> {
        if self.flags.take_rollback() {
            let tracked = self.tracked.borrow();
            if let Some(table) = tracked.as_ref() {
                if let Err(err) = drain::purge(&self.conn, table) {
                    warn!(%err, "pending purge after rollback failed; error latched");
                    self.latch(err);
                }
            }
        }
        if self.flags.take_schema_change() {
            self.refresh_tracked()?;
        }
        if self.flags.take_commit() {
            self.run_drain();
        }
        Ok(())
    }

    /// Deferred post-commit promotion. Errors latch instead of raising so
    /// the caller's own statement result stays intact.
    fn run_drain(&self) {
        if self.in_drain.get() {
            return;
        }
        // Inside an open user transaction nothing has committed yet; the
        // eventual COMMIT re-arms the latch. Any latch observed here is
        // stale and has already been consumed.
        if !self.conn.is_autocommit() {
            return;
        }
        let tracked = self.tracked.borrow();
        let Some(table) = tracked.as_ref() else {
            return;
        };
        let _guard = DrainGuard::enter(&self.in_drain);
        let outcome = drain::promote(&self.conn, table, self.node_id);
        // The drain's own commit (or rollback on failure) re-fires the
        // hooks; neither is a user event.
        self.flags.take_commit();
        self.flags.take_rollback();
        if let Err(err) = outcome {
            warn!(%err, "deferred drain failed; error latched");
            self.latch(err);
        }
    }

    fn refresh_tracked(&self) -> Result<()> {
        let mut tracked = self.tracked.borrow_mut();
        let Some(table) = tracked.as_mut() else {
            return Ok(());
        };
        let columns = schema::introspect(&self.conn, &table.name)?;
        table.columns = schema::tracked_columns(&columns, self.id_kind, &table.name)?;
        schema::write_types_cache(&self.conn, &table.shadow, &columns)?;
        triggers::reinstall(&self.conn, table, self.id_kind)?;
        info!(table = %table.name, columns = table.columns.len(), "schema refreshed");
        Ok(())
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        // Remove the callbacks before the connection closes.
        hooks::clear(&self.conn);
    }
}

/// One result row as a flat list of values.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    /// Value at the given column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// All column values in statement order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// A prepared statement bound to its replica.
///
/// Completion of every execution runs the same post-statement pipeline as
/// [`Replica::execute`], so deferred drains and schema refreshes are never
/// skipped by going through a prepared handle.
pub struct PreparedStatement<'conn> {
    stmt: rusqlite::Statement<'conn>,
    replica: &'conn Replica,
    sql: String,
}

impl PreparedStatement<'_> {
    /// Execute with the given parameters, returning the affected row count.
    pub fn execute(&mut self, params: &[Value]) -> Result<usize> {
        self.replica.check_entry()?;
        let count = self
            .stmt
            .execute(params_from_iter(params.iter().cloned()))
            .map_err(|e| MergeliteError::execution(&self.sql, e))?;
        self.replica.after_statement()?;
        Ok(count)
    }

    /// Run a query, collecting all result rows.
    pub fn query(&mut self, params: &[Value]) -> Result<Vec<Row>> {
        self.replica.check_entry()?;
        let column_count = self.stmt.column_count();
        let mut out = Vec::new();
        {
            let mut rows = self
                .stmt
                .query(params_from_iter(params.iter().cloned()))
                .map_err(|e| MergeliteError::execution(&self.sql, e))?;
            loop {
                match rows.next() {
                    Ok(Some(row)) => {
                        let mut values = Vec::with_capacity(column_count);
                        for index in 0..column_count {
                            values.push(
                                row.get::<_, Value>(index)
                                    .map_err(|e| MergeliteError::execution(&self.sql, e))?,
                            );
                        }
                        out.push(Row { values });
                    }
                    Ok(None) => break,
                    Err(e) => return Err(MergeliteError::execution(&self.sql, e)),
                }
            }
        }
        self.replica.after_statement()?;
        Ok(out)
    }
}
