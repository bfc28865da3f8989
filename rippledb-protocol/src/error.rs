//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid length prefix marker: {0:#04x}")]
    InvalidLengthPrefix(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u32 },

    #[error("connection closed inside a frame: {remaining} bytes missing")]
    UnexpectedEof { remaining: usize },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown request type: {0}")]
    UnknownRequestType(u32),

    #[error("invalid greeting: {0}")]
    InvalidGreeting(String),

    #[error("lsn {lsn} does not follow {current} for replica {replica_id}")]
    LsnOutOfOrder {
        replica_id: u32,
        current: u64,
        lsn: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns true for errors that make the byte stream unusable.
    ///
    /// Message-level errors leave the framing intact; the next frame can
    /// still be read.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidLengthPrefix(_)
                | ProtocolError::FrameTooLarge { .. }
                | ProtocolError::UnexpectedEof { .. }
                | ProtocolError::Io(_)
        )
    }

    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Stable error codes carried in error replies.
///
/// The numeric values are part of the protocol contract: they travel in the
/// low bits of an error reply's type code and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    Unknown = 0,
    IllegalParams = 1,
    TupleFound = 3,
    TupleNotFound = 4,
    Unsupported = 5,
    SpaceExists = 10,
    InvalidMsgpack = 20,
    NoSuchSpace = 36,
    WalIo = 40,
    AccessDenied = 42,
    PasswordMismatch = 47,
    UnknownRequestType = 48,
    Timeout = 78,
    Protocol = 104,
    Loading = 116,
    InconsistentSnapshot = 117,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Maps a wire code back to a known error code.
    pub fn from_u32(code: u32) -> Option<Self> {
        let code = match code {
            0 => ErrorCode::Unknown,
            1 => ErrorCode::IllegalParams,
            3 => ErrorCode::TupleFound,
            4 => ErrorCode::TupleNotFound,
            5 => ErrorCode::Unsupported,
            10 => ErrorCode::SpaceExists,
            20 => ErrorCode::InvalidMsgpack,
            36 => ErrorCode::NoSuchSpace,
            40 => ErrorCode::WalIo,
            42 => ErrorCode::AccessDenied,
            47 => ErrorCode::PasswordMismatch,
            48 => ErrorCode::UnknownRequestType,
            78 => ErrorCode::Timeout,
            104 => ErrorCode::Protocol,
            116 => ErrorCode::Loading,
            117 => ErrorCode::InconsistentSnapshot,
            _ => return None,
        };
        Some(code)
    }

    /// Returns whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::WalIo | ErrorCode::Loading | ErrorCode::Timeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::IllegalParams => "ILLEGAL_PARAMS",
            ErrorCode::TupleFound => "TUPLE_FOUND",
            ErrorCode::TupleNotFound => "TUPLE_NOT_FOUND",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::SpaceExists => "SPACE_EXISTS",
            ErrorCode::InvalidMsgpack => "INVALID_MSGPACK",
            ErrorCode::NoSuchSpace => "NO_SUCH_SPACE",
            ErrorCode::WalIo => "WAL_IO",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::PasswordMismatch => "PASSWORD_MISMATCH",
            ErrorCode::UnknownRequestType => "UNKNOWN_REQUEST_TYPE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Protocol => "PROTOCOL",
            ErrorCode::Loading => "LOADING",
            ErrorCode::InconsistentSnapshot => "INCONSISTENT_SNAPSHOT",
        };
        f.write_str(name)
    }
}
