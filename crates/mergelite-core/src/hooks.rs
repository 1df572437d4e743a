//! Connection-hook plumbing.
//!
//! SQLite forbids issuing SQL from inside the commit and rollback
//! callbacks, so the hooks only latch flags into state shared with the
//! engine; the engine consumes the latches in caller context after the
//! triggering statement returns. The callbacks must be `Send` (and the
//! authorizer additionally unwind-safe), hence plain std atomics and a
//! std mutex rather than anything richer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::Connection;

/// Flags shared between the engine and its registered SQLite callbacks.
#[derive(Debug, Default)]
pub(crate) struct HookFlags {
    commit_seen: AtomicBool,
    rollback_seen: AtomicBool,
    schema_changed: AtomicBool,
    tracked: Mutex<Option<String>>,
}

impl HookFlags {
    pub(crate) fn note_commit(&self) {
        self.commit_seen.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_commit(&self) -> bool {
        self.commit_seen.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn note_rollback(&self) {
        self.rollback_seen.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_rollback(&self) -> bool {
        self.rollback_seen.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn note_schema_change(&self) {
        self.schema_changed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_schema_change(&self) -> bool {
        self.schema_changed.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn set_tracked(&self, name: Option<&str>) {
        let mut slot = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = name.map(str::to_owned);
    }

    pub(crate) fn is_tracked(&self, name: &str) -> bool {
        let slot = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_deref() == Some(name)
    }
}

/// Register the commit, rollback, and authorizer callbacks.
pub(crate) fn register(conn: &Connection, flags: &Arc<HookFlags>) {
    let commit_flags = Arc::clone(flags);
    conn.commit_hook(Some(move || {
        commit_flags.note_commit();
        // Never veto the commit.
        false
    }));

    let rollback_flags = Arc::clone(flags);
    conn.rollback_hook(Some(move || rollback_flags.note_rollback()));

    let auth_flags = Arc::clone(flags);
    conn.authorizer(Some(move |ctx: AuthContext<'_>| match ctx.action {
        AuthAction::AlterTable { table_name, .. } => {
            if auth_flags.is_tracked(table_name) {
                auth_flags.note_schema_change();
            }
            Authorization::Allow
        }
        // Dropping the tracked table would orphan its shadow tables.
        AuthAction::DropTable { table_name, .. } => {
            if auth_flags.is_tracked(table_name) {
                Authorization::Deny
            } else {
                Authorization::Allow
            }
        }
        _ => Authorization::Allow,
    }));
}

/// Remove all three callbacks (shutdown path).
pub(crate) fn clear(conn: &Connection) {
    conn.commit_hook(None::<fn() -> bool>);
    conn.rollback_hook(None::<fn()>);
    conn.authorizer(None::<fn(AuthContext<'_>) -> Authorization>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latches_are_take_once() {
        let flags = HookFlags::default();
        assert!(!flags.take_commit());
        flags.note_commit();
        assert!(flags.take_commit());
        assert!(!flags.take_commit());

        flags.note_rollback();
        assert!(flags.take_rollback());
        flags.note_schema_change();
        assert!(flags.take_schema_change());
    }

    #[test]
    fn tracked_name_matching() {
        let flags = HookFlags::default();
        assert!(!flags.is_tracked("users"));
        flags.set_tracked(Some("users"));
        assert!(flags.is_tracked("users"));
        assert!(!flags.is_tracked("orders"));
        flags.set_tracked(None);
        assert!(!flags.is_tracked("users"));
    }

    #[test]
    fn commit_hook_latches_on_commit() {
        let conn = Connection::open_in_memory().unwrap();
        let flags = Arc::new(HookFlags::default());
        register(&conn, &flags);

        conn.execute("CREATE TABLE t (x INTEGER)", []).unwrap();
        assert!(flags.take_commit());

        conn.execute_batch("BEGIN; INSERT INTO t VALUES (1); ROLLBACK;")
            .unwrap();
        assert!(flags.take_rollback());
    }

    #[test]
    fn authorizer_denies_tracked_drop() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE users (x INTEGER)", []).unwrap();
        conn.execute("CREATE TABLE other (x INTEGER)", []).unwrap();

        let flags = Arc::new(HookFlags::default());
        flags.set_tracked(Some("users"));
        register(&conn, &flags);

        assert!(conn.execute("DROP TABLE users", []).is_err());
        assert!(conn.execute("DROP TABLE other", []).is_ok());
    }

    #[test]
    fn authorizer_latches_tracked_alter() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE users (x INTEGER)", []).unwrap();
        conn.execute("CREATE TABLE other (x INTEGER)", []).unwrap();

        let flags = Arc::new(HookFlags::default());
        flags.set_tracked(Some("users"));
        register(&conn, &flags);

        conn.execute("ALTER TABLE other ADD COLUMN y INTEGER", [])
            .unwrap();
        assert!(!flags.take_schema_change());

        conn.execute("ALTER TABLE users ADD COLUMN y INTEGER", [])
            .unwrap();
        assert!(flags.take_schema_change());
    }

    #[test]
    fn clear_removes_hooks() {
        let conn = Connection::open_in_memory().unwrap();
        let flags = Arc::new(HookFlags::default());
        register(&conn, &flags);
        clear(&conn);

        conn.execute("CREATE TABLE t (x INTEGER)", []).unwrap();
        assert!(!flags.take_commit());
    }
}
