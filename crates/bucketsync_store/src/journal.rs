//! Journal records and replay.
//!
//! Record layout:
//!
//! ```text
//! | magic "BSJR" | version u16 | kind u8 | len u32 | CBOR payload | crc32 u32 |
//! ```
//!
//! Integers are little-endian. The CRC covers kind, len and payload. Replay
//! stops at the first record that is incomplete or fails its CRC; everything
//! from that point on is a torn tail and is truncated when the store opens.

use crate::backend::JournalBackend;
use crate::error::{StoreError, StoreResult};
use crate::tables::{Mutation, Tables};

/// Magic bytes starting every journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"BSJR";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + len (4)
const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

/// Kind of journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// One committed write transaction.
    Commit = 1,
    /// The full table state.
    Snapshot = 2,
}

impl RecordKind {
    /// Converts a byte to a record kind.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Commit),
            2 => Some(Self::Snapshot),
            _ => None,
        }
    }
}

/// A decoded journal record.
#[derive(Debug)]
pub(crate) enum JournalRecord {
    Commit(Vec<Mutation>),
    Snapshot(Box<Tables>),
}

/// Outcome of scanning a journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalScan {
    /// Number of commit records.
    pub commits: usize,
    /// Number of snapshot records.
    pub snapshots: usize,
    /// Length of the valid prefix.
    pub valid_len: u64,
    /// Bytes after the valid prefix.
    pub torn_bytes: u64,
    /// Whether replay stopped on a CRC mismatch rather than a short read.
    pub crc_failure: bool,
    /// Description of why replay stopped early, if it did.
    pub stop_reason: Option<String>,
}

impl JournalScan {
    /// Returns true if every byte belongs to a valid record.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.torn_bytes == 0
    }
}

/// Frames a payload as one record.
pub(crate) fn encode_record(kind: RecordKind, payload: &[u8]) -> StoreResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::codec(format!("record too large: {} bytes", payload.len())))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    buf.extend_from_slice(&JOURNAL_MAGIC);
    buf.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    buf.push(kind as u8);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);

    let crc = compute_crc32(&buf[6..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

fn encode_cbor<T: serde::Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(StoreError::codec)?;
    Ok(buf)
}

fn decode_payload(kind: RecordKind, payload: &[u8]) -> StoreResult<JournalRecord> {
    match kind {
        RecordKind::Commit => ciborium::de::from_reader(payload)
            .map(JournalRecord::Commit)
            .map_err(StoreError::codec),
        RecordKind::Snapshot => ciborium::de::from_reader::<Tables, _>(payload)
            .map(|tables| JournalRecord::Snapshot(Box::new(tables)))
            .map_err(StoreError::codec),
    }
}

/// Splits journal bytes into records, stopping at the first damaged one.
pub(crate) fn decode_records(bytes: &[u8]) -> (Vec<JournalRecord>, JournalScan) {
    let mut records = Vec::new();
    let mut scan = JournalScan::default();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let rest = &bytes[offset..];
        if rest.len() < HEADER_SIZE {
            scan.stop_reason = Some(format!("incomplete header at offset {offset}"));
            break;
        }
        if rest[0..4] != JOURNAL_MAGIC {
            scan.stop_reason = Some(format!("bad magic at offset {offset}"));
            break;
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version != JOURNAL_VERSION {
            scan.stop_reason = Some(format!("unsupported version {version} at offset {offset}"));
            break;
        }
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            scan.stop_reason = Some(format!("incomplete record at offset {offset}"));
            break;
        }

        let stored_crc = u32::from_le_bytes([
            rest[total - 4],
            rest[total - 3],
            rest[total - 2],
            rest[total - 1],
        ]);
        if compute_crc32(&rest[6..HEADER_SIZE + len]) != stored_crc {
            scan.crc_failure = true;
            scan.stop_reason = Some(format!("CRC mismatch at offset {offset}"));
            break;
        }

        let Some(kind) = RecordKind::from_byte(rest[6]) else {
            scan.stop_reason = Some(format!("unknown record kind {} at offset {offset}", rest[6]));
            break;
        };
        match decode_payload(kind, &rest[HEADER_SIZE..HEADER_SIZE + len]) {
            Ok(record) => {
                match kind {
                    RecordKind::Commit => scan.commits += 1,
                    RecordKind::Snapshot => scan.snapshots += 1,
                }
                records.push(record);
            }
            Err(err) => {
                scan.stop_reason = Some(format!("undecodable record at offset {offset}: {err}"));
                break;
            }
        }
        offset += total;
    }

    scan.valid_len = offset as u64;
    scan.torn_bytes = (bytes.len() - offset) as u64;
    (records, scan)
}

/// Replays records into fresh tables.
pub(crate) fn replay(records: Vec<JournalRecord>) -> Tables {
    let mut tables = Tables::default();
    for record in records {
        match record {
            JournalRecord::Snapshot(snapshot) => tables = *snapshot,
            JournalRecord::Commit(mutations) => {
                for mutation in mutations {
                    tables.apply(mutation);
                }
            }
        }
    }
    tables.rebuild_index();
    tables
}

/// The open journal: a backend plus append policy.
pub(crate) struct Journal {
    backend: Box<dyn JournalBackend>,
    sync_on_commit: bool,
}

impl Journal {
    /// Opens a journal, replaying it and truncating any torn tail.
    pub(crate) fn open(
        mut backend: Box<dyn JournalBackend>,
        sync_on_commit: bool,
    ) -> StoreResult<(Self, Tables, JournalScan)> {
        let bytes = backend.read_all()?;
        let (records, scan) = decode_records(&bytes);
        if !scan.is_clean() {
            tracing::warn!(
                valid_len = scan.valid_len,
                torn_bytes = scan.torn_bytes,
                reason = scan.stop_reason.as_deref().unwrap_or(""),
                "truncating torn journal tail"
            );
            backend.truncate(scan.valid_len)?;
        }
        let tables = replay(records);
        Ok((
            Self {
                backend,
                sync_on_commit,
            },
            tables,
            scan,
        ))
    }

    /// Appends one commit record.
    pub(crate) fn append_commit(&mut self, mutations: &[Mutation]) -> StoreResult<()> {
        let payload = encode_cbor(&mutations)?;
        let record = encode_record(RecordKind::Commit, &payload)?;
        let offset = self.backend.append(&record)?;
        if self.sync_on_commit {
            if let Err(err) = self.backend.sync() {
                // Keep the journal consistent with the rolled-back tables.
                let _ = self.backend.truncate(offset);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Rewrites the journal as a single snapshot.
    pub(crate) fn write_snapshot(&mut self, tables: &Tables) -> StoreResult<()> {
        let payload = encode_cbor(tables)?;
        let record = encode_record(RecordKind::Snapshot, &payload)?;
        self.backend.replace(&record)?;
        tracing::debug!(bytes = record.len(), "journal snapshot written");
        Ok(())
    }

    /// Current journal size in bytes.
    pub(crate) fn size(&self) -> StoreResult<u64> {
        self.backend.size()
    }
}

/// Scans raw journal bytes without opening a store.
#[must_use]
pub fn scan_journal(bytes: &[u8]) -> JournalScan {
    decode_records(bytes).1
}

/// Computes a CRC32 checksum (IEEE polynomial).
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
