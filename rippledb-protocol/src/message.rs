//! MessagePack message layer.
//!
//! A message is two consecutive MessagePack maps, a header and a body, both
//! keyed by small unsigned integers (see [`keys`]). Keys this crate does not
//! know about are kept as-is so they survive a decode/encode cycle.

use crate::error::ProtocolError;
use rmpv::Value;
use std::collections::BTreeMap;
use std::io::Cursor;

/// Integer-keyed map used for both header and body.
pub type FieldMap = BTreeMap<u64, Value>;

/// Reserved header and body keys.
pub mod keys {
    // Header
    pub const CODE: u64 = 0x00;
    pub const SYNC: u64 = 0x01;
    pub const REPLICA_ID: u64 = 0x02;
    pub const LSN: u64 = 0x03;
    pub const TIMESTAMP: u64 = 0x04;
    pub const SCHEMA_VERSION: u64 = 0x05;

    // Body
    pub const SPACE_ID: u64 = 0x10;
    pub const INDEX_ID: u64 = 0x11;
    pub const LIMIT: u64 = 0x12;
    pub const OFFSET: u64 = 0x13;
    pub const KEY: u64 = 0x20;
    pub const TUPLE: u64 = 0x21;
    pub const USER_NAME: u64 = 0x23;
    pub const INSTANCE_UUID: u64 = 0x24;
    pub const VCLOCK: u64 = 0x26;
    pub const OPS: u64 = 0x28;
    pub const DATA: u64 = 0x30;
    pub const ERROR: u64 = 0x31;
    pub const ROW_COUNT: u64 = 0x52;
}

/// Request and reply type codes carried in the header `CODE` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestType {
    Ok = 0,
    Select = 1,
    Insert = 2,
    Replace = 3,
    Delete = 5,
    Auth = 7,
    Upsert = 9,
    Nop = 12,
    Ping = 64,
    Join = 65,
    Subscribe = 66,
    Status = 68,
}

impl RequestType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        let kind = match code {
            0 => RequestType::Ok,
            1 => RequestType::Select,
            2 => RequestType::Insert,
            3 => RequestType::Replace,
            5 => RequestType::Delete,
            7 => RequestType::Auth,
            9 => RequestType::Upsert,
            12 => RequestType::Nop,
            64 => RequestType::Ping,
            65 => RequestType::Join,
            66 => RequestType::Subscribe,
            68 => RequestType::Status,
            _ => return None,
        };
        Some(kind)
    }

    /// Returns true for data-modifying requests that end up in the log.
    pub fn is_dml(self) -> bool {
        matches!(
            self,
            RequestType::Insert
                | RequestType::Replace
                | RequestType::Delete
                | RequestType::Upsert
                | RequestType::Nop
        )
    }

    /// Short label used in logs and metrics.
    pub fn name(self) -> &'static str {
        match self {
            RequestType::Ok => "ok",
            RequestType::Select => "select",
            RequestType::Insert => "insert",
            RequestType::Replace => "replace",
            RequestType::Delete => "delete",
            RequestType::Auth => "auth",
            RequestType::Upsert => "upsert",
            RequestType::Nop => "nop",
            RequestType::Ping => "ping",
            RequestType::Join => "join",
            RequestType::Subscribe => "subscribe",
            RequestType::Status => "status",
        }
    }
}

/// A decoded header/body pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub header: FieldMap,
    pub body: FieldMap,
}

impl Message {
    /// Creates a message with the given type code and an empty body.
    pub fn new(code: u32) -> Self {
        let mut header = FieldMap::new();
        header.insert(keys::CODE, Value::from(code));
        Self {
            header,
            body: FieldMap::new(),
        }
    }

    /// Creates a request of `kind` tagged with `sync`.
    pub fn request(kind: RequestType, sync: u64) -> Self {
        Self::new(kind.as_u32()).with_header(keys::SYNC, sync)
    }

    pub fn with_header(mut self, key: u64, value: impl Into<Value>) -> Self {
        self.header.insert(key, value.into());
        self
    }

    pub fn with_body(mut self, key: u64, value: impl Into<Value>) -> Self {
        self.body.insert(key, value.into());
        self
    }

    /// Returns the raw type code.
    pub fn code(&self) -> Result<u32, ProtocolError> {
        let code = self.header_u64(keys::CODE, "code")?;
        code.ok_or(ProtocolError::MissingField("code"))
            .and_then(|c| {
                u32::try_from(c).map_err(|_| ProtocolError::invalid_field("code", "exceeds u32"))
            })
    }

    /// Returns the known request type, if the code maps to one.
    pub fn request_type(&self) -> Result<RequestType, ProtocolError> {
        let code = self.code()?;
        RequestType::from_u32(code).ok_or(ProtocolError::UnknownRequestType(code))
    }

    /// Returns the sync id, `0` when absent.
    pub fn sync(&self) -> u64 {
        self.header
            .get(&keys::SYNC)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Reads an optional unsigned header field.
    pub fn header_u64(&self, key: u64, field: &'static str) -> Result<Option<u64>, ProtocolError> {
        self.header.get(&key).map(|v| value_u64(v, field)).transpose()
    }

    /// Reads an optional unsigned body field.
    pub fn body_u64(&self, key: u64, field: &'static str) -> Result<Option<u64>, ProtocolError> {
        self.body.get(&key).map(|v| value_u64(v, field)).transpose()
    }

    /// Reads a required body field.
    pub fn require_body(&self, key: u64, field: &'static str) -> Result<&Value, ProtocolError> {
        self.body.get(&key).ok_or(ProtocolError::MissingField(field))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_message(&self.header, &self.body)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_message(bytes)
    }
}

/// Encodes a header map followed by a body map.
pub fn encode_message(header: &FieldMap, body: &FieldMap) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(64);
    write_map(&mut buf, header)?;
    write_map(&mut buf, body)?;
    Ok(buf)
}

/// Decodes exactly two maps from `bytes`.
///
/// Fails with `MalformedMessage` if either map is missing, a key is not an
/// unsigned integer, or bytes remain after the body.
pub fn decode_message(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let mut cursor = Cursor::new(bytes);
    let header = read_map(&mut cursor, "header")?;
    let body = read_map(&mut cursor, "body")?;

    let consumed = cursor.position() as usize;
    if consumed != bytes.len() {
        return Err(ProtocolError::MalformedMessage(format!(
            "{} trailing bytes after body",
            bytes.len() - consumed
        )));
    }

    Ok(Message { header, body })
}

fn write_map(buf: &mut Vec<u8>, map: &FieldMap) -> Result<(), ProtocolError> {
    let encode_err = |e: String| ProtocolError::MalformedMessage(format!("encode: {e}"));

    rmp::encode::write_map_len(buf, map.len() as u32).map_err(|e| encode_err(e.to_string()))?;
    for (key, value) in map {
        rmp::encode::write_uint(buf, *key).map_err(|e| encode_err(e.to_string()))?;
        rmpv::encode::write_value(buf, value).map_err(|e| encode_err(e.to_string()))?;
    }
    Ok(())
}

fn read_map(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<FieldMap, ProtocolError> {
    let value = rmpv::decode::read_value(cursor)
        .map_err(|e| ProtocolError::MalformedMessage(format!("{what}: {e}")))?;

    let Value::Map(entries) = value else {
        return Err(ProtocolError::MalformedMessage(format!(
            "{what} is not a map"
        )));
    };

    let mut map = FieldMap::new();
    for (key, value) in entries {
        let key = key.as_u64().ok_or_else(|| {
            ProtocolError::MalformedMessage(format!("{what} key {key} is not an unsigned integer"))
        })?;
        map.insert(key, value);
    }
    Ok(map)
}

/// Interprets `value` as an unsigned integer field.
pub fn value_u64(value: &Value, field: &'static str) -> Result<u64, ProtocolError> {
    value
        .as_u64()
        .ok_or_else(|| ProtocolError::invalid_field(field, format!("expected unsigned, got {value}")))
}

/// Interprets `value` as an unsigned 32-bit field.
pub fn value_u32(value: &Value, field: &'static str) -> Result<u32, ProtocolError> {
    let raw = value_u64(value, field)?;
    u32::try_from(raw).map_err(|_| ProtocolError::invalid_field(field, "exceeds u32"))
}

/// Interprets `value` as a string field.
pub fn value_str<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, ProtocolError> {
    value
        .as_str()
        .ok_or_else(|| ProtocolError::invalid_field(field, format!("expected string, got {value}")))
}

/// Interprets `value` as an array field.
pub fn value_array<'a>(value: &'a Value, field: &'static str) -> Result<&'a [Value], ProtocolError> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| ProtocolError::invalid_field(field, format!("expected array, got {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ping(sync: u64) -> Message {
        Message::request(RequestType::Ping, sync)
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = Message::request(RequestType::Insert, 7)
            .with_body(keys::SPACE_ID, 42u32)
            .with_body(
                keys::TUPLE,
                Value::Array(vec![Value::from(1u64), Value::from("one")]),
            );

        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.sync(), 7);
        assert_eq!(decoded.request_type().unwrap(), RequestType::Insert);
    }

    #[test]
    fn test_unknown_keys_are_preserved() {
        let msg = ping(1)
            .with_header(0x7f, "custom")
            .with_body(0x99, Value::Boolean(true));

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.header.get(&0x7f), Some(&Value::from("custom")));
        assert_eq!(decoded.body.get(&0x99), Some(&Value::Boolean(true)));
    }

    #[test]
    fn test_header_only_is_malformed() {
        let mut bytes = Vec::new();
        write_map(&mut bytes, &ping(1).header).unwrap();

        let result = decode_message(&bytes);
        assert!(matches!(result, Err(ProtocolError::MalformedMessage(_))));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let mut bytes = ping(1).encode().unwrap();
        bytes.push(0xc0);

        let result = decode_message(&bytes);
        assert!(matches!(result, Err(ProtocolError::MalformedMessage(m)) if m.contains("trailing")));
    }

    #[test]
    fn test_non_map_is_malformed() {
        // [1, 2] followed by {}
        let bytes = [0x92, 0x01, 0x02, 0x80];
        assert!(matches!(
            decode_message(&bytes),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_string_key_is_malformed() {
        // {"a": 1} {}
        let bytes = [0x81, 0xa1, b'a', 0x01, 0x80];
        assert!(matches!(
            decode_message(&bytes),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_truncated_body_is_malformed() {
        let bytes = Message::request(RequestType::Select, 1)
            .with_body(keys::SPACE_ID, 512u32)
            .encode()
            .unwrap();
        let result = decode_message(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(ProtocolError::MalformedMessage(_))));
    }

    #[test]
    fn test_missing_code() {
        let msg = Message::default();
        assert!(matches!(msg.code(), Err(ProtocolError::MissingField("code"))));
        assert_eq!(msg.sync(), 0);
    }

    #[test]
    fn test_unknown_request_type() {
        let msg = Message::new(1000);
        assert!(matches!(
            msg.request_type(),
            Err(ProtocolError::UnknownRequestType(1000))
        ));
    }

    #[test]
    fn test_request_type_codes() {
        assert_eq!(RequestType::Ping.as_u32(), 64);
        assert_eq!(RequestType::Join.as_u32(), 65);
        assert_eq!(RequestType::Subscribe.as_u32(), 66);
        assert_eq!(RequestType::from_u32(9), Some(RequestType::Upsert));
        assert_eq!(RequestType::from_u32(4), None);
        assert!(RequestType::Upsert.is_dml());
        assert!(!RequestType::Select.is_dml());
    }

    #[test]
    fn test_decodes_maps_written_by_rmp_serde() {
        let header: BTreeMap<u64, u64> = [(keys::CODE, 64), (keys::SYNC, 3)].into();
        let body: BTreeMap<u64, u64> = BTreeMap::new();
        let mut bytes = rmp_serde::to_vec(&header).unwrap();
        bytes.extend(rmp_serde::to_vec(&body).unwrap());

        let msg = decode_message(&bytes).unwrap();
        assert_eq!(msg.request_type().unwrap(), RequestType::Ping);
        assert_eq!(msg.sync(), 3);
    }

    #[test]
    fn test_field_helpers() {
        assert_eq!(value_u64(&Value::from(5u64), "x").unwrap(), 5);
        assert!(value_u64(&Value::from(-1i64), "x").is_err());
        assert!(value_u32(&Value::from(u64::MAX), "x").is_err());
        assert_eq!(value_str(&Value::from("abc"), "x").unwrap(), "abc");
        assert!(value_array(&Value::from("abc"), "x").is_err());
    }

    proptest! {
        #[test]
        fn prop_message_roundtrip(
            sync in any::<u64>(),
            space_id in any::<u32>(),
            key in any::<i64>(),
            name in "[a-z]{0,16}",
        ) {
            let msg = Message::request(RequestType::Replace, sync)
                .with_body(keys::SPACE_ID, space_id)
                .with_body(keys::TUPLE, Value::Array(vec![Value::from(key), Value::from(name)]));
            let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }
}
