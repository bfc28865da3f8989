//! Main WAL implementation.

use crate::entry::{Checkpoint, WalEntry, WalEntryType, WalRecord};
use crate::error::WalError;
use crate::segment::{Segment, SegmentId, SegmentScanner};
use crate::DEFAULT_SEGMENT_SIZE;
use parking_lot::{Mutex, RwLock};
use rippledb_protocol::Vclock;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Fsync policy for WAL writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// Fsync after every write (safest, slowest).
    #[default]
    EveryWrite,
    /// Fsync after N writes.
    EveryN(u32),
    /// Never fsync automatically (caller must call sync).
    Never,
}

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory to store WAL segments.
    pub dir: PathBuf,
    /// Maximum segment size before rotation.
    pub segment_size: u64,
    pub fsync_policy: FsyncPolicy,
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            fsync_policy: FsyncPolicy::default(),
        }
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }
}

/// Global WAL offset: `segment_id << 40 | offset_within_segment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WalOffset(u64);

impl WalOffset {
    const OFFSET_BITS: u64 = 40;
    const OFFSET_MASK: u64 = (1 << Self::OFFSET_BITS) - 1;

    /// Offset before every record.
    pub const START: WalOffset = WalOffset(0);

    pub fn new(segment_id: SegmentId, offset: u64) -> Self {
        debug_assert!(offset <= Self::OFFSET_MASK, "offset too large");
        Self((segment_id << Self::OFFSET_BITS) | (offset & Self::OFFSET_MASK))
    }

    pub fn segment_id(&self) -> SegmentId {
        self.0 >> Self::OFFSET_BITS
    }

    pub fn offset(&self) -> u64 {
        self.0 & Self::OFFSET_MASK
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// An entry read back from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedEntry {
    pub offset: WalOffset,
    /// Offset just past this entry; pass it to `read_from` to continue.
    pub next_offset: WalOffset,
    pub entry: WalEntry,
}

/// I/O statistics for the WAL.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalStats {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub writes: u64,
    pub reads: u64,
    pub fsyncs: u64,
}

/// Write-Ahead Log.
///
/// Besides the records themselves the log tracks two vclocks: `written`
/// covers every appended row and checkpoint, `durable` only what has been
/// fsynced.
pub struct Wal {
    config: WalConfig,
    /// Current segment for writing; its lock serializes appends.
    current_segment: Mutex<Option<Segment>>,
    /// All segments, opened separately for reading.
    segments: RwLock<BTreeMap<SegmentId, Arc<Mutex<Segment>>>>,
    written: Mutex<Vclock>,
    durable: RwLock<Vclock>,
    entries: AtomicU64,
    writes_since_sync: AtomicU64,
    closed: AtomicBool,
    stats_bytes_written: AtomicU64,
    stats_bytes_read: AtomicU64,
    stats_writes: AtomicU64,
    stats_reads: AtomicU64,
    stats_fsyncs: AtomicU64,
}

impl Wal {
    /// Opens or creates a WAL at the configured directory.
    pub fn open(config: WalConfig) -> Result<Self, WalError> {
        std::fs::create_dir_all(&config.dir)?;

        let wal = Self {
            config,
            current_segment: Mutex::new(None),
            segments: RwLock::new(BTreeMap::new()),
            written: Mutex::new(Vclock::new()),
            durable: RwLock::new(Vclock::new()),
            entries: AtomicU64::new(0),
            writes_since_sync: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            stats_bytes_written: AtomicU64::new(0),
            stats_bytes_read: AtomicU64::new(0),
            stats_writes: AtomicU64::new(0),
            stats_reads: AtomicU64::new(0),
            stats_fsyncs: AtomicU64::new(0),
        };

        wal.recover()?;
        Ok(wal)
    }

    /// Reopens existing segments, drops a torn tail and rebuilds the vclocks.
    fn recover(&self) -> Result<(), WalError> {
        let segment_ids = SegmentScanner::list_segments(&self.config.dir)?;
        let Some(&latest_id) = segment_ids.last() else {
            let first = self.rotate_segment()?;
            *self.current_segment.lock() = Some(first);
            return Ok(());
        };

        let mut vclock = Vclock::new();
        let mut entries = 0u64;

        for &seg_id in &segment_ids {
            let mut segment = Segment::open(&self.config.dir, seg_id, self.config.segment_size)?;
            let scan = segment.scan_from(0)?;

            if scan.garbage > 0 {
                if seg_id != latest_id {
                    return Err(WalError::InvalidState(format!(
                        "segment {} is corrupted at offset {}",
                        seg_id, scan.valid_len
                    )));
                }
                tracing::warn!(
                    segment = seg_id,
                    offset = scan.valid_len,
                    bytes = scan.garbage,
                    "truncating torn WAL tail"
                );
                segment.truncate_at(scan.valid_len)?;
            }

            for (_, record) in &scan.records {
                entries += 1;
                match record.header.entry_type {
                    WalEntryType::Row => {
                        let (id, lsn) = (record.header.replica_id, record.header.lsn);
                        if lsn > vclock.get(id) {
                            vclock.follow(id, lsn)?;
                        }
                    }
                    WalEntryType::Checkpoint => {
                        if let WalEntry::Checkpoint(cp) = record.entry()? {
                            vclock.merge(&cp.vclock);
                        }
                    }
                    _ => {}
                }
            }

            self.segments
                .write()
                .insert(seg_id, Arc::new(Mutex::new(segment)));
        }

        let current = Segment::open(&self.config.dir, latest_id, self.config.segment_size)?;
        *self.current_segment.lock() = Some(current);

        tracing::info!(
            segments = segment_ids.len(),
            entries,
            vclock = %vclock,
            "WAL recovered"
        );

        self.entries.store(entries, Ordering::SeqCst);
        *self.durable.write() = vclock.clone();
        *self.written.lock() = vclock;
        Ok(())
    }

    /// Rotates to a new segment. Called with no segment lock held.
    fn rotate_segment(&self) -> Result<Segment, WalError> {
        let next_id = self
            .segments
            .read()
            .keys()
            .next_back()
            .map(|&id| id + 1)
            .unwrap_or(1);

        let segment = Segment::create(&self.config.dir, next_id, self.config.segment_size)?;
        let reader = Segment::open(&self.config.dir, next_id, self.config.segment_size)?;
        self.segments
            .write()
            .insert(next_id, Arc::new(Mutex::new(reader)));

        tracing::debug!("Rotated to segment {}", next_id);
        Ok(segment)
    }

    /// Appends an entry to the WAL.
    ///
    /// Rows must advance their origin's LSN; a row at or below the written
    /// vclock is rejected before anything is written.
    pub fn append(&self, entry: &WalEntry) -> Result<WalOffset, WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }

        let record = WalRecord::from_entry(entry)?;
        let record_size = record.disk_size();

        let mut current = self.current_segment.lock();

        let mut next_vclock = self.written.lock().clone();
        match entry {
            WalEntry::Row(row) => next_vclock.follow(row.replica_id, row.lsn)?,
            WalEntry::Checkpoint(cp) => next_vclock.merge(&cp.vclock),
            WalEntry::SnapshotRow(_) => {}
        }

        let needs_rotation = match current.as_ref() {
            Some(segment) => !segment.can_fit(record_size),
            None => true,
        };
        if needs_rotation {
            if let Some(mut full) = current.take() {
                full.sync()?;
            }
            *current = Some(self.rotate_segment()?);
        }

        let segment = current
            .as_mut()
            .ok_or_else(|| WalError::InvalidState("no active segment".to_string()))?;
        let segment_id = segment.id();
        let offset = segment.append(&record)?;

        *self.written.lock() = next_vclock;
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.stats_bytes_written
            .fetch_add(record_size as u64, Ordering::Relaxed);
        self.stats_writes.fetch_add(1, Ordering::Relaxed);

        let writes = self.writes_since_sync.fetch_add(1, Ordering::Relaxed) + 1;
        let sync_now = match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => writes >= n as u64,
            FsyncPolicy::Never => false,
        };
        if sync_now {
            self.sync_locked(segment)?;
        }

        Ok(WalOffset::new(segment_id, offset))
    }

    fn sync_locked(&self, segment: &mut Segment) -> Result<(), WalError> {
        segment.sync()?;
        self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        self.writes_since_sync.store(0, Ordering::Relaxed);
        *self.durable.write() = self.written.lock().clone();
        Ok(())
    }

    /// Forces a sync to disk.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut current = self.current_segment.lock();
        match current.as_mut() {
            Some(segment) => self.sync_locked(segment),
            None => Ok(()),
        }
    }

    /// Writes a checkpoint for `vclock` and syncs.
    pub fn checkpoint(&self, vclock: &Vclock, snapshot_rows: u64) -> Result<WalOffset, WalError> {
        let offset = self.append(&WalEntry::Checkpoint(Checkpoint::new(
            vclock.clone(),
            snapshot_rows,
        )))?;
        self.sync()?;
        Ok(offset)
    }

    /// Vclock of every appended row and checkpoint.
    pub fn written_vclock(&self) -> Vclock {
        self.written.lock().clone()
    }

    /// Vclock of what has reached stable storage.
    pub fn durable_vclock(&self) -> Vclock {
        self.durable.read().clone()
    }

    /// Returns true if nothing has ever been written.
    pub fn is_empty(&self) -> bool {
        self.entries.load(Ordering::SeqCst) == 0
    }

    pub fn stats(&self) -> WalStats {
        WalStats {
            bytes_written: self.stats_bytes_written.load(Ordering::Relaxed),
            bytes_read: self.stats_bytes_read.load(Ordering::Relaxed),
            writes: self.stats_writes.load(Ordering::Relaxed),
            reads: self.stats_reads.load(Ordering::Relaxed),
            fsyncs: self.stats_fsyncs.load(Ordering::Relaxed),
        }
    }

    /// Reads entries starting at `from`.
    pub fn read_from(
        &self,
        from: WalOffset,
        limit: Option<usize>,
    ) -> Result<Vec<LoggedEntry>, WalError> {
        let segments: Vec<_> = self
            .segments
            .read()
            .range(from.segment_id()..)
            .map(|(&id, seg)| (id, Arc::clone(seg)))
            .collect();

        let mut results = Vec::new();
        let mut remaining = limit.unwrap_or(usize::MAX);

        for (seg_id, segment) in segments {
            if remaining == 0 {
                break;
            }
            let start = if seg_id == from.segment_id() {
                from.offset()
            } else {
                0
            };
            let batch = self.read_segment(seg_id, &segment, start)?;
            for item in batch.into_iter().take(remaining) {
                results.push(item);
                remaining -= 1;
            }
        }

        self.stats_reads.fetch_add(1, Ordering::Relaxed);
        Ok(results)
    }

    fn read_segment(
        &self,
        seg_id: SegmentId,
        segment: &Mutex<Segment>,
        start: u64,
    ) -> Result<Vec<LoggedEntry>, WalError> {
        let scan = segment.lock().scan_from(start)?;
        let mut out = Vec::with_capacity(scan.records.len());
        for (offset, record) in scan.records {
            let size = record.disk_size() as u64;
            self.stats_bytes_read.fetch_add(size, Ordering::Relaxed);
            out.push(LoggedEntry {
                offset: WalOffset::new(seg_id, offset),
                next_offset: WalOffset::new(seg_id, offset + size),
                entry: record.entry()?,
            });
        }
        Ok(out)
    }

    /// Lazily iterates over every entry, one segment at a time.
    pub fn iter(&self) -> WalIter<'_> {
        WalIter {
            wal: self,
            pending: self.segment_ids().into(),
            buffered: VecDeque::new(),
            failed: false,
        }
    }

    /// Closes the WAL.
    pub fn close(&self) -> Result<(), WalError> {
        self.closed.store(true, Ordering::Release);
        self.sync()
    }

    /// Returns the list of segment IDs.
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments.read().keys().copied().collect()
    }

    /// Returns the total size of all segments in bytes.
    pub fn total_size(&self) -> u64 {
        self.segments.read().values().map(|s| s.lock().size()).sum()
    }
}

/// Iterator returned by [`Wal::iter`].
pub struct WalIter<'a> {
    wal: &'a Wal,
    pending: VecDeque<SegmentId>,
    buffered: VecDeque<LoggedEntry>,
    failed: bool,
}

impl Iterator for WalIter<'_> {
    type Item = Result<LoggedEntry, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if let Some(entry) = self.buffered.pop_front() {
                return Some(Ok(entry));
            }
            let seg_id = self.pending.pop_front()?;
            let Some(segment) = self.wal.segments.read().get(&seg_id).cloned() else {
                continue;
            };
            match self.wal.read_segment(seg_id, &segment, 0) {
                Ok(batch) => self.buffered.extend(batch),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rippledb_protocol::{Dml, Row};
    use rmpv::Value;
    use std::path::Path;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> WalConfig {
        WalConfig::new(dir)
            .with_segment_size(4096)
            .with_fsync_policy(FsyncPolicy::EveryWrite)
    }

    fn row(replica_id: u32, lsn: u64) -> WalEntry {
        WalEntry::Row(Row::new(
            replica_id,
            lsn,
            Dml::Insert {
                space_id: 42,
                tuple: vec![Value::from(lsn), Value::from("some payload data here")],
            },
        ))
    }

    #[test]
    fn test_wal_append_and_read() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path())).unwrap();
        assert!(wal.is_empty());

        let entry = row(1, 1);
        let offset = wal.append(&entry).unwrap();
        assert_eq!(offset, WalOffset::new(1, 0));

        let entries = wal.read_from(WalOffset::START, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry, entry);
        assert_eq!(entries[0].offset, offset);
        assert_eq!(wal.written_vclock(), Vclock::from([(1, 1)]));
        assert_eq!(wal.durable_vclock(), Vclock::from([(1, 1)]));
        assert!(!wal.is_empty());
    }

    #[test]
    fn test_rejects_non_increasing_lsn() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path())).unwrap();

        wal.append(&row(1, 5)).unwrap();
        assert!(matches!(wal.append(&row(1, 5)), Err(WalError::Row(_))));
        assert!(wal.append(&row(1, 4)).is_err());
        wal.append(&row(2, 1)).unwrap();

        assert_eq!(wal.written_vclock(), Vclock::from([(1, 5), (2, 1)]));
        assert_eq!(wal.read_from(WalOffset::START, None).unwrap().len(), 2);
    }

    #[test]
    fn test_durable_lags_without_fsync() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path()).with_fsync_policy(FsyncPolicy::Never);
        let wal = Wal::open(config).unwrap();

        wal.append(&row(1, 1)).unwrap();
        assert_eq!(wal.written_vclock().get(1), 1);
        assert_eq!(wal.durable_vclock().get(1), 0);

        wal.sync().unwrap();
        assert_eq!(wal.durable_vclock().get(1), 1);
    }

    #[test]
    fn test_every_n_policy() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path()).with_fsync_policy(FsyncPolicy::EveryN(3));
        let wal = Wal::open(config).unwrap();

        wal.append(&row(1, 1)).unwrap();
        wal.append(&row(1, 2)).unwrap();
        assert_eq!(wal.durable_vclock().get(1), 0);
        wal.append(&row(1, 3)).unwrap();
        assert_eq!(wal.durable_vclock().get(1), 3);
        assert_eq!(wal.stats().fsyncs, 1);
    }

    #[test]
    fn test_wal_recovery() {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(test_config(dir.path())).unwrap();
            for lsn in 1..=10 {
                wal.append(&row(1, lsn)).unwrap();
            }
            wal.checkpoint(&Vclock::from([(2, 4)]), 0).unwrap();
            wal.close().unwrap();
        }

        let wal = Wal::open(test_config(dir.path())).unwrap();
        assert_eq!(wal.durable_vclock(), Vclock::from([(1, 10), (2, 4)]));
        assert_eq!(wal.iter().count(), 11);
        assert!(wal.append(&row(1, 10)).is_err());
        wal.append(&row(1, 11)).unwrap();
    }

    #[test]
    fn test_recovery_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(test_config(dir.path())).unwrap();
            wal.append(&row(1, 1)).unwrap();
            wal.append(&row(1, 2)).unwrap();
        }

        let path = dir.path().join(crate::segment::segment_filename(1));
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();

        let wal = Wal::open(test_config(dir.path())).unwrap();
        assert_eq!(wal.durable_vclock(), Vclock::from([(1, 1)]));
        wal.append(&row(1, 2)).unwrap();

        let lsns: Vec<u64> = wal
            .iter()
            .map(|e| e.unwrap().entry.origin().1)
            .collect();
        assert_eq!(lsns, vec![1, 2]);
    }

    #[test]
    fn test_wal_segment_rotation() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path()).with_segment_size(512);
        let wal = Wal::open(config).unwrap();

        for lsn in 1..=20 {
            wal.append(&row(1, lsn)).unwrap();
        }

        assert!(wal.segment_ids().len() > 1);
        let entries = wal.read_from(WalOffset::START, None).unwrap();
        assert_eq!(entries.len(), 20);
        assert!(wal.total_size() > 0);
    }

    #[test]
    fn test_read_from_continues_across_segments() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path()).with_segment_size(512)).unwrap();
        for lsn in 1..=20 {
            wal.append(&row(1, lsn)).unwrap();
        }

        let mut next = WalOffset::START;
        let mut seen = Vec::new();
        loop {
            let batch = wal.read_from(next, Some(3)).unwrap();
            let Some(last) = batch.last() else { break };
            next = last.next_offset;
            seen.extend(batch.iter().map(|e| e.entry.origin().1));
        }
        assert_eq!(seen, (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn test_closed_wal_rejects_append() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path())).unwrap();
        wal.close().unwrap();
        assert!(matches!(wal.append(&row(1, 1)), Err(WalError::Closed)));
    }
}
