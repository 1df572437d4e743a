//! Leaf data types for the mergelite replication layer.
//!
//! Everything here is engine-agnostic: the five-tag SQL [`Value`], the
//! two-shape [`RecordId`], and the [`Change`] wire unit that replicas
//! exchange. The engine crate (`mergelite-core`) builds on these; transport
//! layers serialize them with serde.

pub mod change;
pub mod record_id;
pub mod value;

pub use change::{Change, ChangeOp};
pub use record_id::{RecordId, RecordIdKind};
pub use value::Value;

/// Unique identifier of a replica, fixed at engine construction.
pub type NodeId = u64;

/// A logical-clock or per-column version counter.
pub type Version = u64;
