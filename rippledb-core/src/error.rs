//! Core error types.

use rippledb_protocol::{ErrorCode, ProtocolError, ReplicaId};
use thiserror::Error;

/// Errors from the data engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("space {space_id} does not exist")]
    NoSuchSpace { space_id: u32 },

    #[error("space {space_id} ({name}) already exists")]
    SpaceExists { space_id: u32, name: String },

    #[error("duplicate key {key} in space {space_id}")]
    DuplicateKey { space_id: u32, key: String },

    #[error("invalid tuple: {reason}")]
    InvalidTuple { reason: String },

    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("invalid update operation: {reason}")]
    InvalidOps { reason: String },

    #[error("unsupported: {reason}")]
    Unsupported { reason: String },

    #[error("invalid replicated row from replica {replica_id}: {reason}")]
    InvalidRow { replica_id: ReplicaId, reason: String },

    #[error("inconsistent snapshot: {reason}")]
    InconsistentSnapshot { reason: String },

    #[error("timed out waiting for lsn {lsn} of replica {replica_id} (reached {reached})")]
    Timeout {
        replica_id: ReplicaId,
        lsn: u64,
        reached: u64,
    },

    #[error("WAL error: {0}")]
    Wal(#[from] rippledb_wal::WalError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl CoreError {
    /// Returns whether this error indicates the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Wal(e) if e.is_retryable())
            || matches!(self, CoreError::Timeout { .. })
    }

    /// Returns an error code suitable for protocol responses.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CoreError::NoSuchSpace { .. } => ErrorCode::NoSuchSpace,
            CoreError::SpaceExists { .. } => ErrorCode::SpaceExists,
            CoreError::DuplicateKey { .. } => ErrorCode::TupleFound,
            CoreError::InvalidTuple { .. }
            | CoreError::InvalidKey { .. }
            | CoreError::InvalidOps { .. }
            | CoreError::InvalidRow { .. } => ErrorCode::IllegalParams,
            CoreError::Unsupported { .. } => ErrorCode::Unsupported,
            CoreError::InconsistentSnapshot { .. } => ErrorCode::InconsistentSnapshot,
            CoreError::Timeout { .. } => ErrorCode::Timeout,
            CoreError::Wal(_) => ErrorCode::WalIo,
            CoreError::Protocol(_) => ErrorCode::InvalidMsgpack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            CoreError::DuplicateKey {
                space_id: 42,
                key: "1".into()
            }
            .error_code(),
            ErrorCode::TupleFound
        );
        assert_eq!(
            CoreError::NoSuchSpace { space_id: 1 }.error_code(),
            ErrorCode::NoSuchSpace
        );
        assert_eq!(
            CoreError::InvalidOps {
                reason: "x".into()
            }
            .error_code(),
            ErrorCode::IllegalParams
        );
    }

    #[test]
    fn test_retryable() {
        let timeout = CoreError::Timeout {
            replica_id: 1,
            lsn: 5,
            reached: 3,
        };
        assert!(timeout.is_retryable());
        assert!(timeout.to_string().contains("reached 3"));
        assert!(!CoreError::NoSuchSpace { space_id: 1 }.is_retryable());
    }
}
