//! # rippledb-wal
//!
//! Write-Ahead Log implementation for rippledb.
//!
//! This crate provides a durable, append-only log with:
//! - Per-record checksums and origin `(replica_id, lsn)` in every header
//! - Segment-based file management
//! - Configurable fsync policies
//! - Written and durable vclocks, and checkpoints that seal JOIN snapshots
//! - Truncation of a torn tail on open

pub mod entry;
pub mod error;
pub mod log_store;
pub mod segment;
pub mod wal;

pub use entry::{Checkpoint, WalEntry, WalEntryType, WalRecord};
pub use error::WalError;
pub use log_store::{LogStore, RowIter};
pub use segment::{Segment, SegmentId};
pub use wal::{FsyncPolicy, LoggedEntry, Wal, WalConfig, WalIter, WalOffset, WalStats};

/// Default segment size (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// WAL record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 28;
