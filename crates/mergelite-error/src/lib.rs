//! Error types for the mergelite replication layer.
//!
//! One structured enum covers every failure the engine can surface:
//! validation failures that happen before any side effect, SQL failures
//! that carry the offending statement text, and the fatal clock-overflow
//! condition that poisons the engine.

use std::path::PathBuf;

use thiserror::Error;

/// Longest table name accepted by `enable`.
///
/// Derives from the fixed shadow-name prefix plus the longest suffix the
/// installer appends; anything longer would push shadow identifiers past
/// the budget the schema reserves for them.
pub const MAX_TABLE_NAME_LEN: usize = 23;

/// Largest excluded-node set accepted by change extraction.
///
/// Bounds the `NOT IN` parameter list; larger sets are a caller error.
pub const MAX_EXCLUDED_NODES: usize = 100;

/// Primary error type for mergelite operations.
#[derive(Error, Debug)]
pub enum MergeliteError {
    /// Database connection could not be opened.
    #[error("unable to open database: '{path}'")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// A SQL statement failed during execution.
    #[error("statement failed: {sql}")]
    ExecutionFailed {
        sql: String,
        #[source]
        source: rusqlite::Error,
    },

    /// A SQL statement failed to prepare.
    #[error("prepare failed: {sql}")]
    PrepareFailed {
        sql: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Table name contains characters outside `[A-Za-z0-9_]`.
    #[error("invalid table name: '{name}'")]
    InvalidTableName { name: String },

    /// Table name exceeds the shadow-name budget.
    #[error("table name too long: '{name}' ({len} > {max} bytes)")]
    TableNameTooLong { name: String, len: usize, max: usize },

    /// The user table does not exist.
    #[error("no such table: {name}")]
    NoSuchTable { name: String },

    /// A remote change referenced a column this replica does not know.
    #[error("no such column: {name}")]
    NoSuchColumn { name: String },

    /// The table's shape cannot be replicated (composite key, missing id
    /// column, or nothing to track).
    #[error("cannot replicate table {table}: {detail}")]
    UnsupportedSchema { table: String, detail: String },

    /// This instance already replicates a different table.
    #[error("already replicating table {table}")]
    AlreadyTracking { table: String },

    /// Operation requires an enabled table but none was enabled.
    #[error("no table enabled for replication")]
    NoTrackedTable,

    /// Caller exceeded the excluded-node bound.
    #[error("too many excluded nodes: {count} (max {max})")]
    TooManyExcludedNodes { count: usize, max: usize },

    /// The logical clock reached its maximum; the engine is poisoned.
    #[error("logical clock overflow")]
    ClockOverflow,

    /// Invariant violation (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl MergeliteError {
    /// Wrap an execution failure with its statement text.
    pub fn execution(sql: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::ExecutionFailed {
            sql: sql.into(),
            source,
        }
    }

    /// Wrap a prepare failure with its statement text.
    pub fn prepare(sql: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::PrepareFailed {
            sql: sql.into(),
            source,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the engine can continue after this error.
    ///
    /// Clock overflow permanently poisons the instance; everything else
    /// leaves the engine usable after the caller addresses the cause.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ClockOverflow)
    }

    /// Whether the error was raised by validation before any side effect.
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTableName { .. }
                | Self::TableNameTooLong { .. }
                | Self::TooManyExcludedNodes { .. }
        )
    }
}

/// Result type alias using `MergeliteError`.
pub type Result<T> = std::result::Result<T, MergeliteError>;
