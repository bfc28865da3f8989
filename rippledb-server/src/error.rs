//! Server and replication error types.

use crate::auth::Action;
use crate::session::SessionState;
use crate::triggers::{HookError, SessionEvent};
use rippledb_core::CoreError;
use rippledb_protocol::{ErrorCode, ProtocolError, ServerFailure};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while serving a connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("WAL error: {0}")]
    Wal(#[from] rippledb_wal::WalError),

    #[error("user '{user}' lacks {action} access")]
    AccessDenied { user: String, action: Action },

    #[error("authentication failed for user '{0}'")]
    AuthFailed(String),

    #[error("{event} hook failed: {source}")]
    HookFailed {
        event: SessionEvent,
        #[source]
        source: HookError,
    },

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidSessionState { from: SessionState, to: SessionState },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("instance has no dataset yet")]
    NotBootstrapped,

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::Unknown,
            ServerError::Protocol(ProtocolError::UnknownRequestType(_)) => {
                ErrorCode::UnknownRequestType
            }
            ServerError::Protocol(e) if e.is_framing() => ErrorCode::Protocol,
            ServerError::Protocol(_) => ErrorCode::InvalidMsgpack,
            ServerError::Core(e) => e.error_code(),
            ServerError::Wal(_) => ErrorCode::WalIo,
            ServerError::AccessDenied { .. } => ErrorCode::AccessDenied,
            ServerError::AuthFailed(_) => ErrorCode::PasswordMismatch,
            ServerError::HookFailed { .. } => ErrorCode::Unknown,
            ServerError::InvalidSessionState { .. } => ErrorCode::Protocol,
            ServerError::InvalidRequest(_) => ErrorCode::IllegalParams,
            ServerError::Unsupported(_) => ErrorCode::Unsupported,
            ServerError::NotBootstrapped => ErrorCode::Loading,
            ServerError::ShuttingDown => ErrorCode::Unknown,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }

    /// Whether the connection must be dropped instead of answered.
    pub fn closes_session(&self) -> bool {
        match self {
            ServerError::Io(_) | ServerError::HookFailed { .. } | ServerError::ShuttingDown => {
                true
            }
            ServerError::Protocol(e) => e.is_framing(),
            _ => false,
        }
    }
}

/// Errors of a replication stream, on either side.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("master replied with {0}")]
    Server(ServerFailure),

    #[error("inconsistent snapshot: {0}")]
    InconsistentSnapshot(String),

    #[error("failed to apply replicated data: {0}")]
    Apply(CoreError),

    #[error("replication did not start within {0:?}")]
    StartTimeout(Duration),

    #[error("applier stopped: {0}")]
    Stopped(String),
}

impl ReplicationError {
    /// Whether the applier should reconnect and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::PeerUnavailable(_)
            | ReplicationError::Protocol(_)
            | ReplicationError::InconsistentSnapshot(_) => true,
            ReplicationError::Server(failure) => !matches!(
                failure.error_code(),
                Some(ErrorCode::UnknownRequestType | ErrorCode::Unsupported)
            ),
            ReplicationError::Apply(_)
            | ReplicationError::StartTimeout(_)
            | ReplicationError::Stopped(_) => false,
        }
    }
}

impl From<ProtocolError> for ReplicationError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(e) => ReplicationError::PeerUnavailable(e.to_string()),
            e @ ProtocolError::UnexpectedEof { .. } => {
                ReplicationError::PeerUnavailable(e.to_string())
            }
            other => ReplicationError::Protocol(other),
        }
    }
}

impl From<std::io::Error> for ReplicationError {
    fn from(e: std::io::Error) -> Self {
        ReplicationError::PeerUnavailable(e.to_string())
    }
}

impl From<ServerFailure> for ReplicationError {
    fn from(failure: ServerFailure) -> Self {
        ReplicationError::Server(failure)
    }
}
