//! Error channel.
//!
//! A reply is a failure iff the error bit is set in its type code; the low
//! bits then carry the [`ErrorCode`] and the body carries the message under
//! `ERROR`. Success replies use `OK` and never carry `ERROR`.

use crate::error::{ErrorCode, ProtocolError};
use crate::message::{keys, Message, RequestType};
use rmpv::Value;
use std::fmt;

/// Bit set in the type code of every error reply.
pub const ERROR_BIT: u32 = 1 << 15;

/// Builds an error reply for request `sync`.
pub fn encode_error(code: ErrorCode, message: &str, sync: u64) -> Message {
    encode_raw_error(code.as_u32(), message, sync)
}

/// Builds an error reply carrying a raw code (codes from other peers are
/// relayed without interpretation).
pub fn encode_raw_error(code: u32, message: &str, sync: u64) -> Message {
    Message::new(ERROR_BIT | (code & (ERROR_BIT - 1)))
        .with_header(keys::SYNC, sync)
        .with_body(keys::ERROR, message)
}

/// Returns `(code, message)` when `msg` is an error reply.
pub fn decode_error(msg: &Message) -> Option<(u32, String)> {
    let code = msg.code().ok()?;
    if code & ERROR_BIT == 0 {
        return None;
    }
    let text = msg.body.get(&keys::ERROR)?.as_str()?.to_string();
    Some((code & (ERROR_BIT - 1), text))
}

/// Builds an empty success reply for request `sync`.
pub fn ok(sync: u64) -> Message {
    Message::new(RequestType::Ok.as_u32()).with_header(keys::SYNC, sync)
}

/// Builds a success reply carrying `DATA`.
pub fn ok_with_data(sync: u64, data: Vec<Value>) -> Message {
    ok(sync).with_body(keys::DATA, Value::Array(data))
}

/// Failure decoded from an error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFailure {
    /// Raw code as sent by the peer.
    pub code: u32,
    pub message: String,
}

impl ServerFailure {
    /// Returns the known error code, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u32(self.code)
    }

    pub fn is_retryable(&self) -> bool {
        self.error_code().is_some_and(|c| c.is_retryable())
    }
}

impl fmt::Display for ServerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_code() {
            Some(code) => write!(f, "{} ({}): {}", code, self.code, self.message),
            None => write!(f, "error {}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ServerFailure {}

/// A reply classified as exactly one of success or failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success(Message),
    Failure(ServerFailure),
}

impl Reply {
    /// Classifies a decoded reply.
    ///
    /// A message with the error bit and no `ERROR` text, or one without the
    /// bit but carrying `ERROR`, is malformed.
    pub fn classify(msg: Message) -> Result<Self, ProtocolError> {
        let code = msg.code()?;
        let flagged = code & ERROR_BIT != 0;
        let has_error = msg.body.contains_key(&keys::ERROR);

        match (flagged, has_error) {
            (true, true) => decode_error(&msg)
                .map(|failure| Reply::Failure(failure.into()))
                .ok_or_else(|| {
                    ProtocolError::MalformedMessage("error body is not a string".to_string())
                }),
            (true, false) => Err(ProtocolError::MalformedMessage(format!(
                "error code {code:#x} without error body"
            ))),
            (false, true) => Err(ProtocolError::MalformedMessage(
                "error body on a success reply".to_string(),
            )),
            (false, false) => Ok(Reply::Success(msg)),
        }
    }

    pub fn into_result(self) -> Result<Message, ServerFailure> {
        match self {
            Reply::Success(msg) => Ok(msg),
            Reply::Failure(failure) => Err(failure),
        }
    }
}

impl From<(u32, String)> for ServerFailure {
    fn from((code, message): (u32, String)) -> Self {
        ServerFailure { code, message }
    }
}
