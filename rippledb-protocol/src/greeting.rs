//! Connection greeting.
//!
//! The server writes a fixed 128-byte greeting before reading anything:
//!
//! ```text
//! Ripple 0.1.0 (Binary) 6f1b0c0e-...-...                  \n   (64 bytes)
//! 3b0f6a...salt in hex...                                   \n   (64 bytes)
//! ```

use crate::error::ProtocolError;
use uuid::Uuid;

/// Total greeting size in bytes.
pub const GREETING_SIZE: usize = 128;

const LINE_SIZE: usize = GREETING_SIZE / 2;

/// Product name on the first greeting line.
pub const SERVER_NAME: &str = "Ripple";

/// Salt length in bytes (hex encoded on the wire).
pub const SALT_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub version: String,
    pub protocol: String,
    pub instance_uuid: Uuid,
    pub salt: Vec<u8>,
}

impl Greeting {
    pub fn new(instance_uuid: Uuid, salt: Vec<u8>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: crate::PROTOCOL_NAME.to_string(),
            instance_uuid,
            salt,
        }
    }

    pub fn encode(&self) -> Result<[u8; GREETING_SIZE], ProtocolError> {
        let first = format!(
            "{} {} ({}) {}",
            SERVER_NAME, self.version, self.protocol, self.instance_uuid
        );
        let second = hex::encode(&self.salt);

        let mut out = [b' '; GREETING_SIZE];
        put_line(&mut out[..LINE_SIZE], &first)?;
        put_line(&mut out[LINE_SIZE..], &second)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != GREETING_SIZE {
            return Err(ProtocolError::InvalidGreeting(format!(
                "expected {} bytes, got {}",
                GREETING_SIZE,
                bytes.len()
            )));
        }

        let first = take_line(&bytes[..LINE_SIZE])?;
        let second = take_line(&bytes[LINE_SIZE..])?;

        let mut parts = first.split_whitespace();
        let name = parts.next().unwrap_or_default();
        if name != SERVER_NAME {
            return Err(ProtocolError::InvalidGreeting(format!(
                "unexpected server name {name:?}"
            )));
        }
        let version = parts
            .next()
            .ok_or_else(|| ProtocolError::InvalidGreeting("missing version".into()))?;
        let protocol = parts
            .next()
            .and_then(|p| p.strip_prefix('('))
            .and_then(|p| p.strip_suffix(')'))
            .ok_or_else(|| ProtocolError::InvalidGreeting("missing protocol".into()))?;
        let instance_uuid = parts
            .next()
            .ok_or_else(|| ProtocolError::InvalidGreeting("missing instance uuid".into()))
            .and_then(|u| {
                Uuid::parse_str(u).map_err(|e| ProtocolError::InvalidGreeting(e.to_string()))
            })?;

        let salt = hex::decode(second.trim())
            .map_err(|e| ProtocolError::InvalidGreeting(format!("salt: {e}")))?;

        Ok(Self {
            version: version.to_string(),
            protocol: protocol.to_string(),
            instance_uuid,
            salt,
        })
    }
}

fn put_line(dst: &mut [u8], text: &str) -> Result<(), ProtocolError> {
    if text.len() >= dst.len() {
        return Err(ProtocolError::InvalidGreeting(format!(
            "line too long: {text:?}"
        )));
    }
    dst[..text.len()].copy_from_slice(text.as_bytes());
    dst[dst.len() - 1] = b'\n';
    Ok(())
}

fn take_line(src: &[u8]) -> Result<&str, ProtocolError> {
    let Some((&b'\n', body)) = src.split_last() else {
        return Err(ProtocolError::InvalidGreeting(
            "line not newline terminated".into(),
        ));
    };
    std::str::from_utf8(body)
        .map(str::trim_end)
        .map_err(|_| ProtocolError::InvalidGreeting("invalid UTF-8".into()))
}
