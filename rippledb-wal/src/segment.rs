//! WAL segment files.
//!
//! The log is a sequence of `NNNNNNNNNNNNNNNNNNNN.xlog` files, one active at a
//! time. A segment is rotated when the next record would not fit.

use crate::entry::WalRecord;
use crate::error::WalError;
use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Segment identifier (monotonically increasing).
pub type SegmentId = u64;

const SEGMENT_SUFFIX: &str = ".xlog";
const READ_CHUNK: usize = 16 * 1024;

pub fn segment_filename(id: SegmentId) -> String {
    format!("{:020}{}", id, SEGMENT_SUFFIX)
}

pub fn parse_segment_filename(name: &str) -> Option<SegmentId> {
    let digits = name.strip_suffix(SEGMENT_SUFFIX)?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Result of scanning a segment from some offset.
#[derive(Debug, Default)]
pub struct SegmentScan {
    /// Decoded records with their offsets inside the segment.
    pub records: Vec<(u64, WalRecord)>,
    /// End of the last complete, valid record.
    pub valid_len: u64,
    /// Bytes after `valid_len` that did not form a valid record.
    pub garbage: u64,
}

/// A single WAL segment file.
pub struct Segment {
    id: SegmentId,
    path: PathBuf,
    file: File,
    size: u64,
    max_size: u64,
    sync_pending: bool,
}

impl Segment {
    /// Creates a new, empty segment file.
    pub fn create(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            id,
            path,
            file,
            size: 0,
            max_size,
            sync_pending: false,
        })
    }

    /// Opens an existing segment file.
    pub fn open(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            id,
            path,
            file,
            size,
            max_size,
            sync_pending: false,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns whether the segment can take a record of `record_size` bytes.
    ///
    /// An empty segment accepts any record so oversized records still land
    /// somewhere.
    pub fn can_fit(&self, record_size: usize) -> bool {
        self.size == 0 || self.size + record_size as u64 <= self.max_size
    }

    /// Appends a record and returns its offset in the segment.
    pub fn append(&mut self, record: &WalRecord) -> Result<u64, WalError> {
        let encoded = record.encode()?;
        let offset = self.size;

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&encoded)?;
        self.size += encoded.len() as u64;
        self.sync_pending = true;

        Ok(offset)
    }

    pub fn sync(&mut self) -> Result<(), WalError> {
        if self.sync_pending {
            self.file.sync_data()?;
            self.sync_pending = false;
        }
        Ok(())
    }

    /// Decodes records from `start` up to the end of the file.
    ///
    /// Scanning stops at the first incomplete or invalid record; everything
    /// from there on is reported as `garbage` rather than failing, since a
    /// crash can leave a torn record at the tail.
    pub fn scan_from(&mut self, start: u64) -> Result<SegmentScan, WalError> {
        self.file.seek(SeekFrom::Start(start))?;

        let mut scan = SegmentScan {
            valid_len: start,
            ..SegmentScan::default()
        };
        let mut buf = BytesMut::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut offset = start;
        let mut eof = false;

        while !eof {
            let n = self.file.read(&mut chunk)?;
            if n == 0 {
                eof = true;
            } else {
                buf.extend_from_slice(&chunk[..n]);
            }

            loop {
                match WalRecord::decode(&mut buf, offset) {
                    Ok(Some(record)) => {
                        let size = record.disk_size() as u64;
                        scan.records.push((offset, record));
                        offset += size;
                        scan.valid_len = offset;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(segment = self.id, offset, error = %e, "stopping segment scan");
                        let file_len = self.file.metadata()?.len();
                        scan.garbage = file_len.saturating_sub(scan.valid_len);
                        return Ok(scan);
                    }
                }
            }
        }

        scan.garbage = buf.len() as u64;
        Ok(scan)
    }

    /// Truncates the segment at `offset`, dropping a torn tail.
    pub fn truncate_at(&mut self, offset: u64) -> Result<(), WalError> {
        self.file.set_len(offset)?;
        self.size = offset;
        self.sync_pending = true;
        self.sync()
    }
}

/// Segment directory scanner.
pub struct SegmentScanner;

impl SegmentScanner {
    /// Lists all segment IDs in a directory, sorted ascending.
    pub fn list_segments(dir: &Path) -> Result<Vec<SegmentId>, WalError> {
        let mut segments = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(id) = parse_segment_filename(&name.to_string_lossy()) {
                segments.push(id);
            }
        }

        segments.sort_unstable();
        Ok(segments)
    }
}
