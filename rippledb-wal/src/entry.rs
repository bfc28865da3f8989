//! WAL entry types.
//!
//! Each WAL record has the following on-disk format:
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+
//! | magic    | type     | flags    | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 1 byte   | 2 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+
//! | replica_id | lsn      | payload                                  |
//! | 4 bytes    | 8 bytes  | length bytes                             |
//! +------------+----------+------------------------------------------+
//! ```
//!
//! Row payloads are encoded protocol messages, the same bytes a relay sends
//! to a replica. Checkpoint payloads are MessagePack maps.

use crate::error::WalError;
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rippledb_protocol::{Message, ReplicaId, Row, Vclock};
use serde::{Deserialize, Serialize};

/// Magic bytes for WAL records: "RLOG"
pub const WAL_MAGIC: [u8; 4] = *b"RLOG";

/// Maximum record payload size (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Type of WAL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    /// Committed row with its origin LSN.
    Row = 1,
    /// Row received as part of a JOIN snapshot.
    SnapshotRow = 2,
    /// Vclock checkpoint; terminates a run of snapshot rows.
    Checkpoint = 3,
    /// No-op (for padding/alignment).
    Noop = 255,
}

impl TryFrom<u8> for WalEntryType {
    type Error = WalError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(WalEntryType::Row),
            2 => Ok(WalEntryType::SnapshotRow),
            3 => Ok(WalEntryType::Checkpoint),
            255 => Ok(WalEntryType::Noop),
            _ => Err(WalError::InvalidHeader {
                offset: 0,
                reason: format!("unknown entry type: {}", value),
            }),
        }
    }
}

/// A parsed WAL record header.
#[derive(Debug, Clone)]
pub struct WalRecordHeader {
    pub entry_type: WalEntryType,
    pub flags: u8,
    pub payload_len: u32,
    pub crc32c: u32,
    pub replica_id: ReplicaId,
    pub lsn: u64,
}

/// A complete WAL record (header + payload).
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub header: WalRecordHeader,
    pub payload: Bytes,
}

impl WalRecord {
    pub fn new(entry_type: WalEntryType, replica_id: ReplicaId, lsn: u64, payload: Bytes) -> Self {
        let crc = crc32c::crc32c(&payload);
        Self {
            header: WalRecordHeader {
                entry_type,
                flags: 0,
                payload_len: payload.len() as u32,
                crc32c: crc,
                replica_id,
                lsn,
            },
            payload,
        }
    }

    /// Builds the record for a typed entry.
    pub fn from_entry(entry: &WalEntry) -> Result<Self, WalError> {
        let (replica_id, lsn) = entry.origin();
        Ok(Self::new(
            entry.entry_type(),
            replica_id,
            lsn,
            Bytes::from(entry.encode_payload()?),
        ))
    }

    pub fn encode(&self) -> Result<BytesMut, WalError> {
        if self.payload.len() > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge {
                size: self.payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(self.disk_size());
        buf.put_slice(&WAL_MAGIC);
        buf.put_u8(self.header.entry_type as u8);
        buf.put_u8(self.header.flags);
        buf.put_u16(0);
        buf.put_u32(self.header.payload_len);
        buf.put_u32(self.header.crc32c);
        buf.put_u32(self.header.replica_id);
        buf.put_u64(self.header.lsn);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a record from the front of `buf`.
    ///
    /// Returns `Ok(None)` if the buffer holds only part of a record (or the
    /// zero padding of a preallocated tail).
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, WalError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..RECORD_HEADER_SIZE];
        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);
        if magic != WAL_MAGIC {
            if magic == [0, 0, 0, 0] {
                return Ok(None);
            }
            return Err(WalError::InvalidHeader {
                offset,
                reason: format!("invalid magic: {:?}", magic),
            });
        }

        let type_byte = header.get_u8();
        let entry_type = WalEntryType::try_from(type_byte).map_err(|_| WalError::InvalidHeader {
            offset,
            reason: format!("unknown entry type: {}", type_byte),
        })?;
        let flags = header.get_u8();
        header.advance(2);
        let payload_len = header.get_u32() as usize;
        let crc_expected = header.get_u32();
        let replica_id = header.get_u32();
        let lsn = header.get_u64();

        if payload_len > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }
        if buf.len() < RECORD_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != crc_expected {
            return Err(WalError::CorruptedRecord {
                offset,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(Self {
            header: WalRecordHeader {
                entry_type,
                flags,
                payload_len: payload_len as u32,
                crc32c: crc_expected,
                replica_id,
                lsn,
            },
            payload,
        }))
    }

    /// Returns the total size of this record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }

    /// Decodes the typed entry carried by this record.
    pub fn entry(&self) -> Result<WalEntry, WalError> {
        WalEntry::decode_payload(self.header.entry_type, &self.payload)
    }
}

/// Vclock checkpoint written after a snapshot or on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub vclock: Vclock,
    /// Number of snapshot rows immediately preceding this checkpoint that
    /// it makes durable.
    #[serde(default)]
    pub snapshot_rows: u64,
    pub timestamp: i64,
}

impl Checkpoint {
    pub fn new(vclock: Vclock, snapshot_rows: u64) -> Self {
        Self {
            vclock,
            snapshot_rows,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Typed WAL entry with decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum WalEntry {
    Row(Row),
    SnapshotRow(Row),
    Checkpoint(Checkpoint),
}

impl WalEntry {
    /// Returns the entry type for this entry.
    pub fn entry_type(&self) -> WalEntryType {
        match self {
            WalEntry::Row(_) => WalEntryType::Row,
            WalEntry::SnapshotRow(_) => WalEntryType::SnapshotRow,
            WalEntry::Checkpoint(_) => WalEntryType::Checkpoint,
        }
    }

    /// `(replica_id, lsn)` of a committed row, `(0, 0)` otherwise.
    pub fn origin(&self) -> (ReplicaId, u64) {
        match self {
            WalEntry::Row(row) => (row.replica_id, row.lsn),
            _ => (0, 0),
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, WalError> {
        match self {
            WalEntry::Row(row) | WalEntry::SnapshotRow(row) => Ok(row.to_message(0).encode()?),
            WalEntry::Checkpoint(checkpoint) => Ok(rmp_serde::to_vec_named(checkpoint)?),
        }
    }

    fn decode_payload(entry_type: WalEntryType, payload: &[u8]) -> Result<Self, WalError> {
        match entry_type {
            WalEntryType::Row => Ok(WalEntry::Row(Row::from_message(&Message::decode(payload)?)?)),
            WalEntryType::SnapshotRow => Ok(WalEntry::SnapshotRow(Row::from_message(
                &Message::decode(payload)?,
            )?)),
            WalEntryType::Checkpoint => Ok(WalEntry::Checkpoint(rmp_serde::from_slice(payload)?)),
            WalEntryType::Noop => Err(WalError::InvalidState(
                "noop records carry no entry".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rippledb_protocol::Dml;
    use rmpv::Value;

    fn row(lsn: u64) -> Row {
        Row::new(
            1,
            lsn,
            Dml::Insert {
                space_id: 42,
                tuple: vec![Value::from(lsn), Value::from(lsn * lsn)],
            },
        )
    }

    #[test]
    fn test_record_roundtrip() {
        let entry = WalEntry::Row(row(7));
        let record = WalRecord::from_entry(&entry).unwrap();

        let mut buf = record.encode().unwrap();
        let decoded = WalRecord::decode(&mut buf, 0).unwrap().unwrap();

        assert_eq!(decoded.header.entry_type, WalEntryType::Row);
        assert_eq!(decoded.header.replica_id, 1);
        assert_eq!(decoded.header.lsn, 7);
        assert_eq!(decoded.entry().unwrap(), entry);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let entry = WalEntry::Checkpoint(Checkpoint::new(Vclock::from([(1, 9), (2, 4)]), 9));
        let record = WalRecord::from_entry(&entry).unwrap();
        assert_eq!(record.header.lsn, 0);

        let mut buf = record.encode().unwrap();
        let decoded = WalRecord::decode(&mut buf, 0).unwrap().unwrap();
        assert_eq!(decoded.entry().unwrap(), entry);
    }

    #[test]
    fn test_snapshot_row_keeps_type() {
        let entry = WalEntry::SnapshotRow(Row::snapshot(42, vec![Value::from(1u64)]));
        let record = WalRecord::from_entry(&entry).unwrap();
        assert_eq!(record.header.entry_type, WalEntryType::SnapshotRow);
        assert_eq!(record.entry().unwrap(), entry);
    }

    #[test]
    fn test_corrupted_record_detection() {
        let record = WalRecord::from_entry(&WalEntry::Row(row(1))).unwrap();
        let mut buf = record.encode().unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let result = WalRecord::decode(&mut buf, 128);
        assert!(matches!(
            result,
            Err(WalError::CorruptedRecord { offset: 128, .. })
        ));
    }

    #[test]
    fn test_partial_record_needs_more_data() {
        let record = WalRecord::from_entry(&WalEntry::Row(row(1))).unwrap();
        let encoded = record.encode().unwrap();

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 3]);
        assert!(WalRecord::decode(&mut buf, 0).unwrap().is_none());

        let mut buf = BytesMut::from(&encoded[..RECORD_HEADER_SIZE - 1]);
        assert!(WalRecord::decode(&mut buf, 0).unwrap().is_none());
    }

    #[test]
    fn test_zero_padding_is_end_of_data() {
        let mut buf = BytesMut::from(&[0u8; RECORD_HEADER_SIZE * 2][..]);
        assert!(WalRecord::decode(&mut buf, 0).unwrap().is_none());
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = BytesMut::from(&[0xAAu8; RECORD_HEADER_SIZE][..]);
        assert!(matches!(
            WalRecord::decode(&mut buf, 0),
            Err(WalError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_entry_type_conversion() {
        assert_eq!(WalEntryType::try_from(1).unwrap(), WalEntryType::Row);
        assert_eq!(WalEntryType::try_from(3).unwrap(), WalEntryType::Checkpoint);
        assert!(WalEntryType::try_from(9).is_err());
    }

    proptest! {
        #[test]
        fn prop_decode_arbitrary_bytes_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut buf = BytesMut::from(&bytes[..]);
            let _ = WalRecord::decode(&mut buf, 0);
        }
    }
}
