//! Row-level view of the log used by the engine and by relays.

use crate::entry::WalEntry;
use crate::error::WalError;
use crate::wal::Wal;
use rippledb_protocol::{ReplicaId, Row, Vclock};

/// Lazy sequence of rows.
pub type RowIter<'a> = Box<dyn Iterator<Item = Result<Row, WalError>> + Send + 'a>;

/// Persistent log and vclock store.
pub trait LogStore: Send + Sync {
    /// Appends a committed row and returns its LSN.
    fn append(&self, row: &Row) -> Result<u64, WalError>;

    /// Rows originated by `origin` with an LSN strictly above `after_lsn`,
    /// in log order.
    fn read_from(&self, origin: ReplicaId, after_lsn: u64) -> Result<RowIter<'_>, WalError>;

    /// Vclock of rows known to be on stable storage.
    fn durable_vclock(&self) -> Vclock;

    /// Records `vclock` as durable (checkpoint plus fsync).
    fn persist_vclock(&self, vclock: &Vclock) -> Result<(), WalError>;
}

impl LogStore for Wal {
    fn append(&self, row: &Row) -> Result<u64, WalError> {
        Wal::append(self, &WalEntry::Row(row.clone()))?;
        Ok(row.lsn)
    }

    fn read_from(&self, origin: ReplicaId, after_lsn: u64) -> Result<RowIter<'_>, WalError> {
        let rows = self.iter().filter_map(move |item| match item {
            Ok(logged) => match logged.entry {
                WalEntry::Row(row) if row.replica_id == origin && row.lsn > after_lsn => {
                    Some(Ok(row))
                }
                _ => None,
            },
            Err(e) => Some(Err(e)),
        });
        Ok(Box::new(rows))
    }

    fn durable_vclock(&self) -> Vclock {
        Wal::durable_vclock(self)
    }

    fn persist_vclock(&self, vclock: &Vclock) -> Result<(), WalError> {
        self.checkpoint(vclock, 0)?;
        Ok(())
    }
}
