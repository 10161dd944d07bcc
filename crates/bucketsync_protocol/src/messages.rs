//! Streaming sync request and response lines.

use crate::checkpoint::{Checkpoint, CheckpointDiff};
use crate::error::{ProtocolError, ProtocolResult};
use crate::op_id::OpId;
use crate::oplog::OplogEntry;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A bucket cursor sent when opening a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRequest {
    /// Bucket name.
    pub name: String,
    /// Last op id already stored locally for this bucket.
    pub after: OpId,
}

/// Body of a streaming sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingSyncRequest {
    /// Cursors for buckets already known locally.
    pub buckets: Vec<BucketRequest>,
    /// Ask the service to include checksums in checkpoints.
    pub include_checksum: bool,
    /// Ask for row payloads as raw JSON text.
    pub raw_data: bool,
    /// Application-defined sync parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    /// Persistent id of this client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl StreamingSyncRequest {
    /// Creates a request for the given cursors with checksums and raw data enabled.
    pub fn new(buckets: Vec<BucketRequest>) -> Self {
        Self {
            buckets,
            include_checksum: true,
            raw_data: true,
            parameters: None,
            client_id: None,
        }
    }
}

/// A chunk of oplog entries for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDataBucket {
    /// Bucket name.
    pub bucket: String,
    /// Entries in server order.
    pub data: Vec<OplogEntry>,
    /// Whether more data follows for this bucket.
    #[serde(default)]
    pub has_more: bool,
    /// Cursor this chunk starts after.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<OpId>,
    /// Cursor to continue from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_after: Option<OpId>,
}

impl SyncDataBucket {
    /// Creates a complete (no `has_more`) chunk.
    pub fn new(bucket: impl Into<String>, data: Vec<OplogEntry>) -> Self {
        Self {
            bucket: bucket.into(),
            data,
            has_more: false,
            after: None,
            next_after: None,
        }
    }
}

/// A set of bucket chunks saved together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncDataBatch {
    /// The chunks.
    pub buckets: Vec<SyncDataBucket>,
}

impl SyncDataBatch {
    /// Creates a batch.
    pub fn new(buckets: Vec<SyncDataBucket>) -> Self {
        Self { buckets }
    }

    /// Total number of entries across all chunks.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.buckets.iter().map(|b| b.data.len()).sum()
    }
}

impl From<SyncDataBucket> for SyncDataBatch {
    fn from(bucket: SyncDataBucket) -> Self {
        Self {
            buckets: vec![bucket],
        }
    }
}

/// Body of a `checkpoint_complete` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointComplete {
    /// Op id of the checkpoint that is now fully sent.
    pub last_op_id: OpId,
}

/// Body of a `partial_checkpoint_complete` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialCheckpointComplete {
    /// Op id of the target checkpoint.
    pub last_op_id: OpId,
    /// Every bucket with this priority or lower has been fully sent.
    pub priority: u8,
}

/// One line received on a sync stream.
///
/// Lines are tagged by which top-level field is present. Anything without a
/// recognized field decodes as [`StreamingSyncLine::Unknown`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamingSyncLine {
    /// A new target checkpoint.
    Checkpoint(Checkpoint),
    /// An incremental change to the target checkpoint.
    CheckpointDiff(CheckpointDiff),
    /// All data for the target checkpoint has been sent.
    CheckpointComplete(CheckpointComplete),
    /// All data for buckets up to a priority has been sent.
    PartialCheckpointComplete(PartialCheckpointComplete),
    /// Oplog data for one bucket.
    Data(SyncDataBucket),
    /// Keepalive carrying the remaining token lifetime in seconds.
    KeepAlive {
        /// Seconds until the credentials used for this stream expire.
        token_expires_in: i64,
    },
    /// A line with no recognized field.
    Unknown {
        /// Top-level field names of the line, for logging.
        fields: Vec<String>,
    },
}

/// Field-tagged envelope shared by the JSON and CBOR encodings.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checkpoint: Option<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checkpoint_diff: Option<CheckpointDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checkpoint_complete: Option<CheckpointComplete>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partial_checkpoint_complete: Option<PartialCheckpointComplete>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<SyncDataBucket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_expires_in: Option<i64>,
}

impl From<Envelope> for StreamingSyncLine {
    fn from(env: Envelope) -> Self {
        if let Some(cp) = env.checkpoint {
            StreamingSyncLine::Checkpoint(cp)
        } else if let Some(diff) = env.checkpoint_diff {
            StreamingSyncLine::CheckpointDiff(diff)
        } else if let Some(done) = env.checkpoint_complete {
            StreamingSyncLine::CheckpointComplete(done)
        } else if let Some(partial) = env.partial_checkpoint_complete {
            StreamingSyncLine::PartialCheckpointComplete(partial)
        } else if let Some(data) = env.data {
            StreamingSyncLine::Data(data)
        } else if let Some(token_expires_in) = env.token_expires_in {
            StreamingSyncLine::KeepAlive { token_expires_in }
        } else {
            StreamingSyncLine::Unknown { fields: Vec::new() }
        }
    }
}

impl From<&StreamingSyncLine> for Envelope {
    fn from(line: &StreamingSyncLine) -> Self {
        let mut env = Envelope::default();
        match line {
            StreamingSyncLine::Checkpoint(cp) => env.checkpoint = Some(cp.clone()),
            StreamingSyncLine::CheckpointDiff(diff) => env.checkpoint_diff = Some(diff.clone()),
            StreamingSyncLine::CheckpointComplete(done) => {
                env.checkpoint_complete = Some(done.clone())
            }
            StreamingSyncLine::PartialCheckpointComplete(partial) => {
                env.partial_checkpoint_complete = Some(partial.clone())
            }
            StreamingSyncLine::Data(data) => env.data = Some(data.clone()),
            StreamingSyncLine::KeepAlive { token_expires_in } => {
                env.token_expires_in = Some(*token_expires_in)
            }
            StreamingSyncLine::Unknown { .. } => {}
        }
        env
    }
}

impl StreamingSyncLine {
    /// Decodes one NDJSON line.
    pub fn from_json(line: &[u8]) -> ProtocolResult<Self> {
        let env: Envelope = serde_json::from_slice(line)?;
        match StreamingSyncLine::from(env) {
            StreamingSyncLine::Unknown { .. } => {
                let fields: BTreeMap<String, IgnoredAny> = serde_json::from_slice(line)?;
                Ok(StreamingSyncLine::Unknown {
                    fields: fields.into_keys().collect(),
                })
            }
            known => Ok(known),
        }
    }

    /// Encodes this line as a single JSON object (no trailing newline).
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(&Envelope::from(self))?)
    }

    /// Decodes a CBOR-encoded line, as carried in socket payload frames.
    pub fn from_cbor(bytes: &[u8]) -> ProtocolResult<Self> {
        let env: Envelope = ciborium::de::from_reader(bytes).map_err(ProtocolError::cbor)?;
        match StreamingSyncLine::from(env) {
            StreamingSyncLine::Unknown { .. } => {
                let fields: BTreeMap<String, IgnoredAny> =
                    ciborium::de::from_reader(bytes).map_err(ProtocolError::cbor)?;
                Ok(StreamingSyncLine::Unknown {
                    fields: fields.into_keys().collect(),
                })
            }
            known => Ok(known),
        }
    }

    /// Encodes this line as CBOR.
    pub fn to_cbor(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&Envelope::from(self), &mut buf).map_err(ProtocolError::cbor)?;
        Ok(buf)
    }

    /// Returns the line's tag as it appears on the wire, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            StreamingSyncLine::Checkpoint(_) => "checkpoint",
            StreamingSyncLine::CheckpointDiff(_) => "checkpoint_diff",
            StreamingSyncLine::CheckpointComplete(_) => "checkpoint_complete",
            StreamingSyncLine::PartialCheckpointComplete(_) => "partial_checkpoint_complete",
            StreamingSyncLine::Data(_) => "data",
            StreamingSyncLine::KeepAlive { .. } => "token_expires_in",
            StreamingSyncLine::Unknown { .. } => "unknown",
        }
    }
}

/// Response of the write-checkpoint endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCheckpointResponse {
    /// Response payload.
    pub data: WriteCheckpointData,
}

/// Payload of [`WriteCheckpointResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCheckpointData {
    /// Op id guaranteed to include every write uploaded so far.
    pub write_checkpoint: OpId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::BucketChecksum;
    use crate::oplog::OpType;

    #[test]
    fn decodes_each_line_kind() {
        let line = StreamingSyncLine::from_json(
            br#"{"checkpoint":{"last_op_id":"3","buckets":[{"bucket":"b1","checksum":6}]}}"#,
        )
        .unwrap();
        assert!(matches!(line, StreamingSyncLine::Checkpoint(ref cp) if cp.last_op_id == OpId::new(3)));

        let line = StreamingSyncLine::from_json(
            br#"{"checkpoint_diff":{"last_op_id":"4","updated_buckets":[],"removed_buckets":["b2"]}}"#,
        )
        .unwrap();
        assert!(matches!(line, StreamingSyncLine::CheckpointDiff(ref d) if d.removed_buckets == vec!["b2".to_string()]));

        let line =
            StreamingSyncLine::from_json(br#"{"checkpoint_complete":{"last_op_id":"4"}}"#).unwrap();
        assert_eq!(
            line,
            StreamingSyncLine::CheckpointComplete(CheckpointComplete {
                last_op_id: OpId::new(4)
            })
        );

        let line = StreamingSyncLine::from_json(
            br#"{"partial_checkpoint_complete":{"last_op_id":"3","priority":1}}"#,
        )
        .unwrap();
        assert_eq!(
            line,
            StreamingSyncLine::PartialCheckpointComplete(PartialCheckpointComplete {
                last_op_id: OpId::new(3),
                priority: 1,
            })
        );
        assert_eq!(line.kind(), "partial_checkpoint_complete");

        let line = StreamingSyncLine::from_json(
            br#"{"data":{"bucket":"b1","data":[{"op_id":"1","op":"MOVE","checksum":1}],"has_more":false,"after":"0","next_after":"1"}}"#,
        )
        .unwrap();
        match line {
            StreamingSyncLine::Data(data) => {
                assert_eq!(data.bucket, "b1");
                assert_eq!(data.data[0].op, OpType::Move);
                assert_eq!(data.next_after, Some(OpId::new(1)));
            }
            other => panic!("unexpected line {other:?}"),
        }

        let line = StreamingSyncLine::from_json(br#"{"token_expires_in":0}"#).unwrap();
        assert_eq!(line, StreamingSyncLine::KeepAlive { token_expires_in: 0 });
    }

    #[test]
    fn unrecognized_line_is_unknown() {
        let line =
            StreamingSyncLine::from_json(br#"{"sync_complete":true,"stats":{"ops":3}}"#).unwrap();
        assert_eq!(
            line,
            StreamingSyncLine::Unknown {
                fields: vec!["stats".into(), "sync_complete".into()]
            }
        );
        assert_eq!(line.kind(), "unknown");

        let empty = StreamingSyncLine::Unknown { fields: Vec::new() };
        let decoded = StreamingSyncLine::from_cbor(&empty.to_cbor().unwrap()).unwrap();
        assert_eq!(decoded, empty);
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(StreamingSyncLine::from_json(b"{\"checkpoint\":").is_err());
    }

    #[test]
    fn cbor_and_json_agree() {
        let line = StreamingSyncLine::Checkpoint(
            Checkpoint::new(7, vec![BucketChecksum::new("b", 99)]).with_write_checkpoint(6),
        );
        let from_cbor = StreamingSyncLine::from_cbor(&line.to_cbor().unwrap()).unwrap();
        let from_json = StreamingSyncLine::from_json(line.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(from_cbor, line);
        assert_eq!(from_json, line);
    }

    #[test]
    fn request_serializes_expected_fields() {
        let mut req = StreamingSyncRequest::new(vec![BucketRequest {
            name: "b1".into(),
            after: OpId::new(3),
        }]);
        req.client_id = Some("c-1".into());
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["buckets"][0]["after"], "3");
        assert_eq!(value["include_checksum"], true);
        assert_eq!(value["raw_data"], true);
        assert_eq!(value["client_id"], "c-1");
        assert!(value.get("parameters").is_none());
    }

    #[test]
    fn write_checkpoint_response() {
        let resp: WriteCheckpointResponse =
            serde_json::from_str(r#"{"data":{"write_checkpoint":"12"}}"#).unwrap();
        assert_eq!(resp.data.write_checkpoint, OpId::new(12));
    }
}
