//! Locally captured writes awaiting upload.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateType {
    /// Insert or replace the whole row.
    Put,
    /// Update a subset of columns.
    Patch,
    /// Delete the row.
    Delete,
}

impl UpdateType {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateType::Put => "PUT",
            UpdateType::Patch => "PATCH",
            UpdateType::Delete => "DELETE",
        }
    }
}

impl std::str::FromStr for UpdateType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUT" => Ok(UpdateType::Put),
            "PATCH" => Ok(UpdateType::Patch),
            "DELETE" => Ok(UpdateType::Delete),
            other => Err(ProtocolError::UnknownOpType(other.to_string())),
        }
    }
}

/// One queued local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudEntry {
    /// Auto-increment id; defines upload order.
    pub client_id: u64,
    /// Kind of write.
    pub op: UpdateType,
    /// Table of the written row.
    pub table: String,
    /// Id of the written row.
    pub id: String,
    /// Local transaction the write belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<u64>,
    /// Column values. Every column but `id` for `PUT`, the changed ones for `PATCH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl CrudEntry {
    /// Converts to the shape handed to upload connectors.
    #[must_use]
    pub fn to_output(&self) -> CrudEntryOutput {
        CrudEntryOutput {
            op_id: self.client_id,
            op: self.op,
            table: self.table.clone(),
            id: self.id.clone(),
            tx_id: self.transaction_id,
            data: self.data.clone(),
        }
    }
}

/// Upload representation of a [`CrudEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudEntryOutput {
    /// The entry's client id.
    pub op_id: u64,
    /// Kind of write.
    pub op: UpdateType,
    /// Table name.
    #[serde(rename = "type")]
    pub table: String,
    /// Row id.
    pub id: String,
    /// Transaction id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<u64>,
    /// Column values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> CrudEntry {
        let mut data = Map::new();
        data.insert("description".into(), json!("test"));
        CrudEntry {
            client_id: 3,
            op: UpdateType::Put,
            table: "assets".into(),
            id: "O1".into(),
            transaction_id: Some(2),
            data: Some(data),
        }
    }

    #[test]
    fn output_uses_type_and_tx_id() {
        let value = serde_json::to_value(sample().to_output()).unwrap();
        assert_eq!(
            value,
            json!({
                "op_id": 3,
                "op": "PUT",
                "type": "assets",
                "id": "O1",
                "tx_id": 2,
                "data": {"description": "test"}
            })
        );
    }

    #[test]
    fn delete_has_no_data() {
        let entry = CrudEntry {
            op: UpdateType::Delete,
            data: None,
            transaction_id: None,
            ..sample()
        };
        let value = serde_json::to_value(entry.to_output()).unwrap();
        assert!(value.get("data").is_none());
        assert!(value.get("tx_id").is_none());
    }

    #[test]
    fn update_type_parse() {
        assert_eq!("PATCH".parse::<UpdateType>().unwrap(), UpdateType::Patch);
        assert!("UPSERT".parse::<UpdateType>().is_err());
        assert_eq!(UpdateType::Delete.as_str(), "DELETE");
    }
}
