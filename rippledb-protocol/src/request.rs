//! Typed requests.

use crate::error::ProtocolError;
use crate::message::{keys, value_array, value_str, value_u32, Message, RequestType};
use crate::row::Dml;
use crate::vclock::{ReplicaId, Vclock};
use rmpv::Value;
use uuid::Uuid;

/// Auth mechanism accepted in the `AUTH` tuple.
pub const AUTH_MECHANISM: &str = "sha256";

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping,
    /// Reports the server's vclock and instance uuid.
    Status,
    Select {
        space_id: u32,
        key: Vec<Value>,
        limit: u32,
        offset: u32,
    },
    Dml(Dml),
    Auth {
        user: String,
        token: String,
    },
    /// Carries the replica's vclock, empty for a fresh instance.
    Join {
        instance_uuid: Uuid,
        replica_id: ReplicaId,
        vclock: Vclock,
    },
    Subscribe {
        instance_uuid: Uuid,
        replica_id: ReplicaId,
        vclock: Vclock,
    },
}

impl Request {
    pub fn kind(&self) -> RequestType {
        match self {
            Request::Ping => RequestType::Ping,
            Request::Status => RequestType::Status,
            Request::Select { .. } => RequestType::Select,
            Request::Dml(dml) => dml.request_type(),
            Request::Auth { .. } => RequestType::Auth,
            Request::Join { .. } => RequestType::Join,
            Request::Subscribe { .. } => RequestType::Subscribe,
        }
    }

    pub fn to_message(&self, sync: u64) -> Message {
        let msg = Message::request(self.kind(), sync);
        match self {
            Request::Ping | Request::Status => msg,
            Request::Select {
                space_id,
                key,
                limit,
                offset,
            } => msg
                .with_body(keys::SPACE_ID, *space_id)
                .with_body(keys::INDEX_ID, 0u32)
                .with_body(keys::KEY, Value::Array(key.clone()))
                .with_body(keys::LIMIT, *limit)
                .with_body(keys::OFFSET, *offset),
            Request::Dml(dml) => dml.write_body(msg),
            Request::Auth { user, token } => msg
                .with_body(keys::USER_NAME, user.as_str())
                .with_body(
                    keys::TUPLE,
                    Value::Array(vec![Value::from(AUTH_MECHANISM), Value::from(token.as_str())]),
                ),
            Request::Join {
                instance_uuid,
                replica_id,
                vclock,
            }
            | Request::Subscribe {
                instance_uuid,
                replica_id,
                vclock,
            } => msg
                .with_header(keys::REPLICA_ID, *replica_id)
                .with_body(keys::INSTANCE_UUID, instance_uuid.to_string())
                .with_body(keys::VCLOCK, vclock.to_value()),
        }
    }

    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        let kind = msg.request_type()?;
        let request = match kind {
            RequestType::Ping => Request::Ping,
            RequestType::Status => Request::Status,
            RequestType::Select => Request::Select {
                space_id: value_u32(msg.require_body(keys::SPACE_ID, "space_id")?, "space_id")?,
                key: match msg.body.get(&keys::KEY) {
                    Some(v) => value_array(v, "key")?.to_vec(),
                    None => Vec::new(),
                },
                limit: optional_u32(msg, keys::LIMIT, "limit")?.unwrap_or(u32::MAX),
                offset: optional_u32(msg, keys::OFFSET, "offset")?.unwrap_or(0),
            },
            RequestType::Auth => {
                let user = value_str(msg.require_body(keys::USER_NAME, "user_name")?, "user_name")?;
                let tuple = value_array(msg.require_body(keys::TUPLE, "tuple")?, "tuple")?;
                let token = match tuple {
                    [mechanism, token] if mechanism.as_str() == Some(AUTH_MECHANISM) => {
                        value_str(token, "tuple")?
                    }
                    _ => {
                        return Err(ProtocolError::invalid_field(
                            "tuple",
                            format!("expected [\"{AUTH_MECHANISM}\", token]"),
                        ))
                    }
                };
                Request::Auth {
                    user: user.to_string(),
                    token: token.to_string(),
                }
            }
            RequestType::Join => Request::Join {
                instance_uuid: instance_uuid(msg)?,
                replica_id: header_replica_id(msg)?,
                vclock: optional_vclock(msg)?,
            },
            RequestType::Subscribe => Request::Subscribe {
                instance_uuid: instance_uuid(msg)?,
                replica_id: header_replica_id(msg)?,
                vclock: optional_vclock(msg)?,
            },
            RequestType::Ok => {
                return Err(ProtocolError::MalformedMessage(
                    "OK is not a request".to_string(),
                ))
            }
            dml => Request::Dml(Dml::from_message(dml, msg)?),
        };
        Ok(request)
    }
}

/// Replica acknowledgement carrying its applied vclock.
pub fn ack(vclock: &Vclock) -> Message {
    Message::new(RequestType::Ok.as_u32()).with_body(keys::VCLOCK, vclock.to_value())
}

/// Final message of a JOIN snapshot stream.
pub fn join_marker(sync: u64, vclock: &Vclock, row_count: u64) -> Message {
    crate::reply::ok(sync)
        .with_body(keys::VCLOCK, vclock.to_value())
        .with_body(keys::ROW_COUNT, row_count)
}

/// Reads `VCLOCK` from a reply body.
pub fn reply_vclock(msg: &Message) -> Result<Vclock, ProtocolError> {
    Vclock::from_value(msg.require_body(keys::VCLOCK, "vclock")?)
}

fn optional_u32(msg: &Message, key: u64, field: &'static str) -> Result<Option<u32>, ProtocolError> {
    msg.body.get(&key).map(|v| value_u32(v, field)).transpose()
}

/// `VCLOCK` from a request body; absent means empty.
fn optional_vclock(msg: &Message) -> Result<Vclock, ProtocolError> {
    match msg.body.get(&keys::VCLOCK) {
        Some(v) => Vclock::from_value(v),
        None => Ok(Vclock::new()),
    }
}

fn header_replica_id(msg: &Message) -> Result<ReplicaId, ProtocolError> {
    let value = msg
        .header
        .get(&keys::REPLICA_ID)
        .ok_or(ProtocolError::MissingField("replica_id"))?;
    value_u32(value, "replica_id")
}

fn instance_uuid(msg: &Message) -> Result<Uuid, ProtocolError> {
    let raw = value_str(
        msg.require_body(keys::INSTANCE_UUID, "instance_uuid")?,
        "instance_uuid",
    )?;
    Uuid::parse_str(raw).map_err(|e| ProtocolError::invalid_field("instance_uuid", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(request: Request) -> Request {
        let bytes = request.to_message(11).encode().unwrap();
        let msg = Message::decode(&bytes).unwrap();
        assert_eq!(msg.sync(), 11);
        Request::from_message(&msg).unwrap()
    }

    #[test]
    fn test_ping_has_empty_body() {
        let msg = Request::Ping.to_message(1);
        assert!(msg.body.is_empty());
        assert_eq!(roundtrip(Request::Ping), Request::Ping);
    }

    #[test]
    fn test_select_roundtrip() {
        let request = Request::Select {
            space_id: 42,
            key: vec![Value::from(3u64)],
            limit: 1,
            offset: 0,
        };
        assert_eq!(roundtrip(request.clone()), request);
    }

    #[test]
    fn test_select_defaults() {
        let msg = Message::request(RequestType::Select, 1).with_body(keys::SPACE_ID, 42u32);
        let request = Request::from_message(&msg).unwrap();
        assert_eq!(
            request,
            Request::Select {
                space_id: 42,
                key: vec![],
                limit: u32::MAX,
                offset: 0
            }
        );
    }

    #[test]
    fn test_auth_roundtrip() {
        let request = Request::Auth {
            user: "replicator".into(),
            token: "secret".into(),
        };
        assert_eq!(roundtrip(request.clone()), request);
    }

    #[test]
    fn test_auth_rejects_unknown_mechanism() {
        let msg = Message::request(RequestType::Auth, 1)
            .with_body(keys::USER_NAME, "u")
            .with_body(
                keys::TUPLE,
                Value::Array(vec![Value::from("chap-sha1"), Value::from("x")]),
            );
        assert!(matches!(
            Request::from_message(&msg),
            Err(ProtocolError::InvalidField { field: "tuple", .. })
        ));
    }

    #[test]
    fn test_join_and_subscribe_roundtrip() {
        let uuid = Uuid::new_v4();
        let join = Request::Join {
            instance_uuid: uuid,
            replica_id: 2,
            vclock: Vclock::from([(2, 4)]),
        };
        assert_eq!(roundtrip(join.clone()), join);

        let fresh = Request::Join {
            instance_uuid: uuid,
            replica_id: 2,
            vclock: Vclock::new(),
        };
        let msg = fresh.to_message(1);
        assert!(msg.body.contains_key(&keys::VCLOCK));
        assert_eq!(Request::from_message(&msg).unwrap(), fresh);

        let subscribe = Request::Subscribe {
            instance_uuid: uuid,
            replica_id: 2,
            vclock: Vclock::from([(1, 9)]),
        };
        assert_eq!(roundtrip(subscribe.clone()), subscribe);
    }

    #[test]
    fn test_join_without_vclock_is_empty() {
        let msg = Message::request(RequestType::Join, 1)
            .with_header(keys::REPLICA_ID, 2u32)
            .with_body(keys::INSTANCE_UUID, Uuid::new_v4().to_string());
        match Request::from_message(&msg).unwrap() {
            Request::Join { vclock, .. } => assert!(vclock.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_join_requires_replica_id() {
        let msg = Message::request(RequestType::Join, 1)
            .with_body(keys::INSTANCE_UUID, Uuid::new_v4().to_string());
        assert!(matches!(
            Request::from_message(&msg),
            Err(ProtocolError::MissingField("replica_id"))
        ));
    }

    #[test]
    fn test_dml_request() {
        let request = Request::Dml(Dml::Insert {
            space_id: 42,
            tuple: vec![Value::from(1u64), Value::from(1u64)],
        });
        assert_eq!(roundtrip(request.clone()), request);
    }

    #[test]
    fn test_join_marker() {
        let clock = Vclock::from([(1, 9)]);
        let msg = join_marker(3, &clock, 9);
        assert_eq!(msg.request_type().unwrap(), RequestType::Ok);
        assert_eq!(reply_vclock(&msg).unwrap(), clock);
        assert_eq!(msg.body_u64(keys::ROW_COUNT, "row_count").unwrap(), Some(9));
    }

    #[test]
    fn test_ok_is_not_a_request() {
        assert!(Request::from_message(&ack(&Vclock::new())).is_err());
    }
}
