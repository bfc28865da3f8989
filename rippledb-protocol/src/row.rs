//! Data-modifying requests and the log rows that carry them.

use crate::error::ProtocolError;
use crate::message::{keys, value_array, value_u32, value_u64, Message, RequestType};
use crate::vclock::ReplicaId;
use rmpv::Value;

/// A data-modifying operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Dml {
    Insert {
        space_id: u32,
        tuple: Vec<Value>,
    },
    Replace {
        space_id: u32,
        tuple: Vec<Value>,
    },
    /// Insert `tuple`, or apply `ops` to the existing tuple with the same key.
    Upsert {
        space_id: u32,
        tuple: Vec<Value>,
        ops: Vec<Value>,
    },
    Delete {
        space_id: u32,
        key: Vec<Value>,
    },
    Nop,
}

impl Dml {
    pub fn request_type(&self) -> RequestType {
        match self {
            Dml::Insert { .. } => RequestType::Insert,
            Dml::Replace { .. } => RequestType::Replace,
            Dml::Upsert { .. } => RequestType::Upsert,
            Dml::Delete { .. } => RequestType::Delete,
            Dml::Nop => RequestType::Nop,
        }
    }

    pub fn space_id(&self) -> Option<u32> {
        match self {
            Dml::Insert { space_id, .. }
            | Dml::Replace { space_id, .. }
            | Dml::Upsert { space_id, .. }
            | Dml::Delete { space_id, .. } => Some(*space_id),
            Dml::Nop => None,
        }
    }

    /// Writes the operation's body fields into `msg`.
    pub fn write_body(&self, msg: Message) -> Message {
        match self {
            Dml::Insert { space_id, tuple } | Dml::Replace { space_id, tuple } => msg
                .with_body(keys::SPACE_ID, *space_id)
                .with_body(keys::TUPLE, Value::Array(tuple.clone())),
            Dml::Upsert {
                space_id,
                tuple,
                ops,
            } => msg
                .with_body(keys::SPACE_ID, *space_id)
                .with_body(keys::TUPLE, Value::Array(tuple.clone()))
                .with_body(keys::OPS, Value::Array(ops.clone())),
            Dml::Delete { space_id, key } => msg
                .with_body(keys::SPACE_ID, *space_id)
                .with_body(keys::KEY, Value::Array(key.clone())),
            Dml::Nop => msg,
        }
    }

    /// Parses the body of a DML message of type `kind`.
    pub fn from_message(kind: RequestType, msg: &Message) -> Result<Self, ProtocolError> {
        let space_id = || value_u32(msg.require_body(keys::SPACE_ID, "space_id")?, "space_id");
        let array = |key: u64, field: &'static str| -> Result<Vec<Value>, ProtocolError> {
            Ok(value_array(msg.require_body(key, field)?, field)?.to_vec())
        };

        let dml = match kind {
            RequestType::Insert => Dml::Insert {
                space_id: space_id()?,
                tuple: array(keys::TUPLE, "tuple")?,
            },
            RequestType::Replace => Dml::Replace {
                space_id: space_id()?,
                tuple: array(keys::TUPLE, "tuple")?,
            },
            RequestType::Upsert => Dml::Upsert {
                space_id: space_id()?,
                tuple: array(keys::TUPLE, "tuple")?,
                ops: match msg.body.get(&keys::OPS) {
                    Some(v) => value_array(v, "ops")?.to_vec(),
                    None => Vec::new(),
                },
            },
            RequestType::Delete => Dml::Delete {
                space_id: space_id()?,
                key: array(keys::KEY, "key")?,
            },
            RequestType::Nop => Dml::Nop,
            other => {
                return Err(ProtocolError::MalformedMessage(format!(
                    "{} is not a data-modifying request",
                    other.name()
                )))
            }
        };
        Ok(dml)
    }
}

/// A committed (or snapshot) row as stored in the log and streamed to
/// replicas.
///
/// Snapshot rows sent during JOIN carry `lsn == 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub replica_id: ReplicaId,
    pub lsn: u64,
    /// Commit time in seconds since the Unix epoch.
    pub timestamp: f64,
    pub dml: Dml,
}

impl Row {
    pub fn new(replica_id: ReplicaId, lsn: u64, dml: Dml) -> Self {
        Self {
            replica_id,
            lsn,
            timestamp: now_seconds(),
            dml,
        }
    }

    /// Builds a snapshot row (`lsn == 0`).
    pub fn snapshot(space_id: u32, tuple: Vec<Value>) -> Self {
        Self::new(0, 0, Dml::Insert { space_id, tuple })
    }

    pub fn is_snapshot(&self) -> bool {
        self.lsn == 0
    }

    pub fn to_message(&self, sync: u64) -> Message {
        let msg = Message::request(self.dml.request_type(), sync)
            .with_header(keys::REPLICA_ID, self.replica_id)
            .with_header(keys::LSN, self.lsn)
            .with_header(keys::TIMESTAMP, self.timestamp);
        self.dml.write_body(msg)
    }

    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        let kind = msg.request_type()?;
        if !kind.is_dml() {
            return Err(ProtocolError::MalformedMessage(format!(
                "{} is not a log row",
                kind.name()
            )));
        }

        let replica_id = match msg.header.get(&keys::REPLICA_ID) {
            Some(v) => value_u32(v, "replica_id")?,
            None => 0,
        };
        let lsn = match msg.header.get(&keys::LSN) {
            Some(v) => value_u64(v, "lsn")?,
            None => 0,
        };
        let timestamp = match msg.header.get(&keys::TIMESTAMP) {
            Some(Value::F64(t)) => *t,
            Some(Value::F32(t)) => *t as f64,
            Some(other) => value_u64(other, "timestamp")? as f64,
            None => 0.0,
        };

        Ok(Self {
            replica_id,
            lsn,
            timestamp,
            dml: Dml::from_message(kind, msg)?,
        })
    }
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
