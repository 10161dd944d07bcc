//! Oplog entries.

use crate::checksum::Checksum;
use crate::error::ProtocolError;
use crate::op_id::OpId;
use serde::{Deserialize, Deserializer, Serialize};

/// The kind of change an oplog entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    /// Insert or replace a row part.
    Put,
    /// Remove a row part from this bucket.
    Remove,
    /// Advance the bucket cursor without touching data.
    Move,
    /// Invalidate every earlier entry in the bucket.
    Clear,
}

impl OpType {
    /// Returns true for ops that are stored per row (`PUT` and `REMOVE`).
    #[must_use]
    pub fn is_data(self) -> bool {
        matches!(self, OpType::Put | OpType::Remove)
    }

    /// Returns the wire name of this op.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Put => "PUT",
            OpType::Remove => "REMOVE",
            OpType::Move => "MOVE",
            OpType::Clear => "CLEAR",
        }
    }
}

impl std::str::FromStr for OpType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUT" => Ok(OpType::Put),
            "REMOVE" => Ok(OpType::Remove),
            "MOVE" => Ok(OpType::Move),
            "CLEAR" => Ok(OpType::Clear),
            other => Err(ProtocolError::UnknownOpType(other.to_string())),
        }
    }
}

/// Identifies one materialized row: `(object_type, object_id)`.
///
/// Subkeys are deliberately not part of the key; every subkey of an object
/// resolves to the same local row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    /// Table (object type) name.
    pub table: String,
    /// Row id (object id).
    pub id: String,
}

impl RowKey {
    /// Creates a row key.
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

/// A single versioned change to a row part within one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    /// Position of this entry within its bucket.
    pub op_id: OpId,
    /// Kind of change.
    pub op: OpType,
    /// Table of the affected row. Absent for `MOVE` and `CLEAR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    /// Id of the affected row. Absent for `MOVE` and `CLEAR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// Independently versioned part of the row.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "raw_text"
    )]
    pub subkey: Option<String>,
    /// Checksum contribution of this entry.
    pub checksum: Checksum,
    /// Row payload as JSON text (`PUT` only).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "raw_text"
    )]
    pub data: Option<String>,
}

impl OplogEntry {
    /// Creates a `PUT` entry.
    pub fn put(
        op_id: impl Into<OpId>,
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        data: impl Into<String>,
        checksum: u32,
    ) -> Self {
        Self {
            op_id: op_id.into(),
            op: OpType::Put,
            object_type: Some(object_type.into()),
            object_id: Some(object_id.into()),
            subkey: None,
            checksum: Checksum::new(checksum),
            data: Some(data.into()),
        }
    }

    /// Creates a `REMOVE` entry.
    pub fn remove(
        op_id: impl Into<OpId>,
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        checksum: u32,
    ) -> Self {
        Self {
            op_id: op_id.into(),
            op: OpType::Remove,
            object_type: Some(object_type.into()),
            object_id: Some(object_id.into()),
            subkey: None,
            checksum: Checksum::new(checksum),
            data: None,
        }
    }

    /// Creates a `MOVE` entry.
    pub fn moved(op_id: impl Into<OpId>, checksum: u32) -> Self {
        Self::marker(op_id.into(), OpType::Move, checksum)
    }

    /// Creates a `CLEAR` entry.
    pub fn clear(op_id: impl Into<OpId>, checksum: u32) -> Self {
        Self::marker(op_id.into(), OpType::Clear, checksum)
    }

    fn marker(op_id: OpId, op: OpType, checksum: u32) -> Self {
        Self {
            op_id,
            op,
            object_type: None,
            object_id: None,
            subkey: None,
            checksum: Checksum::new(checksum),
            data: None,
        }
    }

    /// Sets the subkey.
    #[must_use]
    pub fn with_subkey(mut self, subkey: impl Into<String>) -> Self {
        self.subkey = Some(subkey.into());
        self
    }

    /// Returns the materialized row this entry affects, if any.
    #[must_use]
    pub fn row_key(&self) -> Option<RowKey> {
        match (&self.object_type, &self.object_id) {
            (Some(table), Some(id)) if self.op.is_data() => Some(RowKey::new(table, id)),
            _ => None,
        }
    }
}

/// Accepts either JSON text or an inline JSON value, normalizing to text.
fn raw_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
