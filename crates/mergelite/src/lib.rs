//! Conflict-free replication for SQLite tables.
//!
//! mergelite retrofits an embedded SQLite database with CRDT semantics:
//! independently mutated replicas of the same schema reconcile
//! deterministically, with no coordination, under a per-column
//! last-writer-wins rule. Ordinary `INSERT`/`UPDATE`/`DELETE` statements
//! against an unchanged table are captured transparently; synchronization
//! is a pull ([`Replica::changes_since`]) plus a push ([`Replica::merge`]),
//! with transport left entirely to the caller.
//!
//! ```no_run
//! use mergelite::Replica;
//!
//! # fn main() -> mergelite::Result<()> {
//! let a = Replica::open("a.db", 1)?;
//! a.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
//! a.enable("users")?;
//! a.execute("INSERT INTO users (id, name) VALUES (1, 'Alice')")?;
//!
//! let b = Replica::open("b.db", 2)?;
//! b.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
//! b.enable("users")?;
//!
//! // Ship node 1's changes to node 2 however you like.
//! let changes = a.changes_since(0, &[], 0)?;
//! let accepted = b.merge(&changes)?;
//! assert_eq!(accepted.len(), changes.len());
//! # Ok(())
//! # }
//! ```
//!
//! Known limitations: one tracked table per replica instance, additive
//! schema changes only, and no resurrection handling across tombstones
//! (a remote column change never consults the tombstone table).

pub use mergelite_core::{PreparedStatement, Replica, ReplicaConfig, Row};
pub use mergelite_error::{MergeliteError, Result, MAX_EXCLUDED_NODES, MAX_TABLE_NAME_LEN};
pub use mergelite_types::{Change, ChangeOp, NodeId, RecordId, RecordIdKind, Value, Version};
