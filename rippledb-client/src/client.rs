//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use rippledb_protocol::message::value_u64;
use rippledb_protocol::{keys, Dml, Greeting, Message, ReplicaId, Request, Vclock};
use rmpv::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Interval between status polls in [`Client::wait_lsn`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of a write request.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    /// Instance that stamped the row.
    pub replica_id: ReplicaId,
    pub lsn: u64,
    /// Tuples returned by the server (new, replaced or deleted tuple).
    pub tuples: Vec<Value>,
}

/// High-level client for rippledb.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    pub fn greeting(&self) -> Option<Greeting> {
        self.conn.greeting()
    }

    // =========================================================================
    // System operations
    // =========================================================================

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.conn.request(Request::Ping).await?;
        Ok(())
    }

    /// Gets the server status map.
    pub async fn status(&self) -> Result<Value, ClientError> {
        let reply = self.conn.request(Request::Status).await?;
        data(&reply)?
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::UnexpectedReply("empty status".to_string()))
    }

    /// The server's current vclock, from its status.
    pub async fn vclock(&self) -> Result<Vclock, ClientError> {
        let status = self.status().await?;
        let vclock = status
            .as_map()
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|(k, _)| k.as_str() == Some("vclock"))
                    .map(|(_, v)| v)
            })
            .ok_or_else(|| ClientError::UnexpectedReply("status without vclock".to_string()))?;
        Ok(Vclock::from_value(vclock)?)
    }

    /// Polls the server until its vclock component for `replica_id` reaches
    /// `lsn`.
    pub async fn wait_lsn(
        &self,
        replica_id: ReplicaId,
        lsn: u64,
        timeout: Duration,
    ) -> Result<Vclock, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            let vclock = self.vclock().await?;
            if vclock.get(replica_id) >= lsn {
                return Ok(vclock);
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Authenticates the session.
    pub async fn auth(&self, user: &str, token: &str) -> Result<(), ClientError> {
        self.conn
            .request(Request::Auth {
                user: user.to_string(),
                token: token.to_string(),
            })
            .await?;
        Ok(())
    }

    // =========================================================================
    // Data operations
    // =========================================================================

    /// Selects tuples by primary key; an empty key returns the whole space.
    pub async fn select(
        &self,
        space_id: u32,
        key: Vec<Value>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Value>, ClientError> {
        let reply = self
            .conn
            .request(Request::Select {
                space_id,
                key,
                limit,
                offset,
            })
            .await?;
        data(&reply)
    }

    pub async fn insert(&self, space_id: u32, tuple: Vec<Value>) -> Result<WriteResult, ClientError> {
        self.write(Dml::Insert { space_id, tuple }).await
    }

    pub async fn replace(
        &self,
        space_id: u32,
        tuple: Vec<Value>,
    ) -> Result<WriteResult, ClientError> {
        self.write(Dml::Replace { space_id, tuple }).await
    }

    /// Inserts `tuple`, or applies `ops` (`[op, field, arg]`) to the existing
    /// tuple with the same key.
    pub async fn upsert(
        &self,
        space_id: u32,
        tuple: Vec<Value>,
        ops: Vec<Value>,
    ) -> Result<WriteResult, ClientError> {
        self.write(Dml::Upsert {
            space_id,
            tuple,
            ops,
        })
        .await
    }

    pub async fn delete(&self, space_id: u32, key: Vec<Value>) -> Result<WriteResult, ClientError> {
        self.write(Dml::Delete { space_id, key }).await
    }

    async fn write(&self, dml: Dml) -> Result<WriteResult, ClientError> {
        let reply = self.conn.request(Request::Dml(dml)).await?;
        let replica_id = reply.header_u64(keys::REPLICA_ID, "replica_id")?.unwrap_or(0);
        let replica_id = ReplicaId::try_from(replica_id)
            .map_err(|_| ClientError::UnexpectedReply(format!("replica id {replica_id}")))?;
        Ok(WriteResult {
            replica_id,
            lsn: reply.header_u64(keys::LSN, "lsn")?.unwrap_or(0),
            tuples: data(&reply)?,
        })
    }
}

/// The `DATA` array of a reply; absent means empty.
fn data(reply: &Message) -> Result<Vec<Value>, ClientError> {
    match reply.body.get(&keys::DATA) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(ClientError::UnexpectedReply(format!(
            "DATA is not an array: {other}"
        ))),
        None => Ok(Vec::new()),
    }
}

/// Reads an unsigned integer out of a status map entry.
pub fn status_u64(status: &Value, field: &'static str) -> Option<u64> {
    status
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(field))
        .and_then(|(_, v)| value_u64(v, field).ok())
}
