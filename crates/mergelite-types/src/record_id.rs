use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use uuid::Uuid;

use crate::value::Value;

/// The record-id shape a replica is configured for.
///
/// The shape is fixed at engine construction; a single database mixes shapes
/// only across *engines*, never within one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RecordIdKind {
    /// Records are addressed by the user table's `rowid` column.
    Integer,
    /// Records are addressed by a 16-byte opaque id in a column named `id`.
    Uuid,
}

impl RecordIdKind {
    /// The SQL expression that names the id column in trigger bodies and
    /// write-through statements.
    pub const fn id_column(self) -> &'static str {
        match self {
            Self::Integer => "rowid",
            Self::Uuid => "\"id\"",
        }
    }
}

/// A record identifier: either a signed 64-bit rowid or a 16-byte opaque id.
///
/// Represented as a tagged sum so bind and read paths dispatch on the
/// variant instead of trait objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum RecordId {
    /// Integer rowid.
    Int(i64),
    /// 16-byte opaque identifier.
    Uuid(Uuid),
}

impl RecordId {
    /// The kind this identifier belongs to.
    pub const fn kind(&self) -> RecordIdKind {
        match self {
            Self::Int(_) => RecordIdKind::Integer,
            Self::Uuid(_) => RecordIdKind::Uuid,
        }
    }

    /// Decode a record id read back from the database under the given kind.
    ///
    /// Returns `None` when the stored value does not have the expected
    /// shape (wrong storage class, or a blob that is not 16 bytes).
    pub fn from_value(value: &Value, kind: RecordIdKind) -> Option<Self> {
        match (kind, value) {
            (RecordIdKind::Integer, Value::Integer(i)) => Some(Self::Int(*i)),
            (RecordIdKind::Uuid, Value::Blob(b)) => Uuid::from_slice(b).ok().map(Self::Uuid),
            _ => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Uuid(u) => write!(f, "{u}"),
        }
    }
}

impl ToSql for RecordId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Int(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Self::Uuid(u) => ToSqlOutput::Borrowed(ValueRef::Blob(u.as_bytes())),
        })
    }
}

impl From<i64> for RecordId {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<Uuid> for RecordId {
    fn from(u: Uuid) -> Self {
        Self::Uuid(u)
    }
}
