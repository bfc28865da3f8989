//! # rippledb-protocol
//!
//! Wire protocol implementation for rippledb.
//!
//! This crate provides:
//! - Length-prefixed framing with a MessagePack unsigned integer prefix
//! - Header/body MessagePack message encoding with integer keys
//! - The error channel: error-flagged reply codes with a message body
//! - The connection greeting, vclocks and replication rows
//! - Framed async readers/writers with a non-blocking probe

pub mod codec;
pub mod error;
pub mod frame;
pub mod greeting;
pub mod io;
pub mod message;
pub mod reply;
pub mod request;
pub mod row;
pub mod vclock;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameHeader, FIXHEADER_SIZE};
pub use greeting::{Greeting, GREETING_SIZE};
pub use io::{FrameReader, FrameWriter, ReadStatus};
pub use message::{keys, FieldMap, Message, RequestType};
pub use reply::{Reply, ServerFailure, ERROR_BIT};
pub use request::Request;
pub use row::{Dml, Row};
pub use vclock::{ReplicaId, Vclock};

/// Protocol name announced in the greeting.
pub const PROTOCOL_NAME: &str = "Binary";

/// Default port for rippledb server.
pub const DEFAULT_PORT: u16 = 3301;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
