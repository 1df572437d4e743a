use crate::record_id::RecordId;
use crate::value::Value;
use crate::{NodeId, Version};

/// Trigger operation codes written into the pending buffer.
///
/// The numeric values are part of the installed trigger SQL; changing them
/// invalidates already-installed triggers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum ChangeOp {
    /// Row inserted; one pending tuple per tracked column.
    Insert = 0,
    /// Column updated; one pending tuple per actually-changed column.
    Update = 1,
    /// Row deleted; exactly one pending tuple with an empty column name.
    Delete = 2,
}

impl ChangeOp {
    /// Decode a pending-buffer operation code.
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Insert),
            1 => Some(Self::Update),
            2 => Some(Self::Delete),
            _ => None,
        }
    }

    /// The code stored in the pending buffer.
    pub const fn code(self) -> i64 {
        self as i64
    }
}

/// One replicated change: the wire unit exchanged between replicas.
///
/// A change is either a column write (`column_name` present) or a record
/// tombstone (`column_name` absent). A column write whose `value` is absent
/// sets the column to NULL; NULL never travels as an explicit value.
///
/// `(column_version, db_version, node_id)` is the LWW identity under which
/// peers resolve the change; `local_db_version` is the *receiving* replica's
/// clock when the change was persisted locally and is only ever used as a
/// sync cursor, never compared across replicas.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Change {
    /// Identifier of the affected record.
    pub record_id: RecordId,
    /// Affected column; `None` marks a record tombstone.
    pub column_name: Option<String>,
    /// New value; `None` with a column name present means SQL NULL.
    pub value: Option<Value>,
    /// Per-(record, column) counter at the originating replica.
    pub column_version: Version,
    /// The originating replica's logical clock at change creation.
    pub db_version: Version,
    /// Originating replica.
    pub node_id: NodeId,
    /// This replica's clock when the change was locally persisted.
    pub local_db_version: Version,
    /// Ephemeral processing flags; never persisted or transmitted.
    #[serde(skip)]
    pub flags: u32,
}

impl Change {
    /// Build a column change.
    pub fn column(
        record_id: RecordId,
        column_name: impl Into<String>,
        value: Option<Value>,
        column_version: Version,
        db_version: Version,
        node_id: NodeId,
        local_db_version: Version,
    ) -> Self {
        Self {
            record_id,
            column_name: Some(column_name.into()),
            // Canonical wire form: NULL is encoded by absence.
            value: value.filter(|v| !v.is_null()),
            column_version,
            db_version,
            node_id,
            local_db_version,
            flags: 0,
        }
    }

    /// Build a record tombstone.
    pub const fn tombstone(
        record_id: RecordId,
        db_version: Version,
        node_id: NodeId,
        local_db_version: Version,
    ) -> Self {
        Self {
            record_id,
            column_name: None,
            value: None,
            column_version: 0,
            db_version,
            node_id,
            local_db_version,
            flags: 0,
        }
    }

    /// Whether this change deletes the whole record.
    pub const fn is_tombstone(&self) -> bool {
        self.column_name.is_none()
    }

    /// The LWW comparison key for a column change.
    ///
    /// Total because node ids are unique per replica; the maximum key wins.
    pub const fn lww_key(&self) -> (Version, Version, NodeId) {
        (self.column_version, self.db_version, self.node_id)
    }
}
