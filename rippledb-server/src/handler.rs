//! Request dispatch.
//!
//! Request/response traffic is answered here. JOIN and SUBSCRIBE are only
//! validated; the connection loop hands the socket to the relay for them.

use crate::auth::{AccessControl, Action};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::replication::ReplicationRegistry;
use crate::session::Session;
use crate::triggers::{SessionEvent, TriggerRegistry};
use rippledb_core::Engine;
use rippledb_protocol::message::keys;
use rippledb_protocol::reply::{encode_error, ok, ok_with_data};
use rippledb_protocol::{Message, ReplicaId, Request, Vclock};
use rmpv::Value;
use std::sync::Arc;
use uuid::Uuid;

/// What the connection loop should do after a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Send this reply and keep serving.
    Reply(Message),
    /// Stream a snapshot, then return to request/response.
    Join {
        sync: u64,
        instance_uuid: Uuid,
        replica_id: ReplicaId,
        /// What the replica already holds; empty for a fresh instance.
        vclock: Vclock,
    },
    /// Relay the log for the rest of the connection.
    Subscribe {
        sync: u64,
        instance_uuid: Uuid,
        replica_id: ReplicaId,
        vclock: Vclock,
    },
}

/// Request handler shared by all connections.
pub struct RequestHandler {
    engine: Arc<Engine>,
    access: Arc<dyn AccessControl>,
    triggers: Arc<TriggerRegistry>,
    replication: Arc<ReplicationRegistry>,
    instance_uuid: Uuid,
    /// Metrics for request tracking.
    metrics: Option<Arc<Metrics>>,
}

impl RequestHandler {
    /// Creates a handler with no hooks, a private replication registry and a
    /// random instance uuid.
    pub fn new(engine: Arc<Engine>, access: Arc<dyn AccessControl>) -> Self {
        Self {
            engine,
            access,
            triggers: Arc::new(TriggerRegistry::new()),
            replication: Arc::new(ReplicationRegistry::new()),
            instance_uuid: Uuid::new_v4(),
            metrics: None,
        }
    }

    pub fn with_triggers(mut self, triggers: Arc<TriggerRegistry>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_replication(mut self, replication: Arc<ReplicationRegistry>) -> Self {
        self.replication = replication;
        self
    }

    pub fn with_instance_uuid(mut self, uuid: Uuid) -> Self {
        self.instance_uuid = uuid;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        &self.triggers
    }

    pub fn replication(&self) -> &Arc<ReplicationRegistry> {
        &self.replication
    }

    pub fn instance_uuid(&self) -> Uuid {
        self.instance_uuid
    }

    /// Returns a reference to the metrics, if set.
    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Handles one decoded message.
    pub fn handle(&self, session: &mut Session, msg: &Message) -> Result<Outcome, ServerError> {
        session.record_request();

        let type_name = msg.request_type().map(|t| t.name()).unwrap_or("unknown");
        let timer = self.metrics.as_ref().map(|m| {
            m.request_duration
                .with_label_values(&[type_name])
                .start_timer()
        });

        let result = Request::from_message(msg)
            .map_err(ServerError::from)
            .and_then(|request| self.dispatch(session, msg.sync(), request));

        if let Some(ref metrics) = self.metrics {
            metrics.requests_total.with_label_values(&[type_name]).inc();
            if let Err(ref e) = result {
                metrics
                    .errors_total
                    .with_label_values(&[&e.error_code().to_string()])
                    .inc();
            }
        }
        drop(timer); // Observation happens on drop

        if let Err(ref e) = result {
            tracing::debug!("[{}] {} failed: {}", session.peer, type_name, e);
        }
        result
    }

    /// Encodes a failed request for the error channel.
    pub fn error_reply(&self, error: &ServerError, sync: u64) -> Message {
        encode_error(error.error_code(), &error.to_string(), sync)
    }

    fn dispatch(
        &self,
        session: &mut Session,
        sync: u64,
        request: Request,
    ) -> Result<Outcome, ServerError> {
        let reply = match request {
            Request::Ping => ok(sync),
            Request::Status => ok_with_data(sync, vec![self.status()]),
            Request::Select {
                space_id,
                key,
                limit,
                offset,
            } => {
                self.require(session, Action::Read)?;
                let tuples = self.engine.select(space_id, &key, offset, limit)?;
                ok_with_data(sync, tuples.into_iter().map(Value::Array).collect())
            }
            Request::Dml(dml) => {
                self.require(session, Action::Write)?;
                let result = self.engine.execute(dml)?;
                ok_with_data(sync, result.tuples.into_iter().map(Value::Array).collect())
                    .with_header(keys::REPLICA_ID, self.engine.instance_id())
                    .with_header(keys::LSN, result.lsn)
            }
            Request::Auth { user, token } => {
                if !self.access.authenticate(&user, &token) {
                    return Err(ServerError::AuthFailed(user));
                }
                session.set_user(user);
                self.triggers
                    .fire(SessionEvent::Auth, &session.info())
                    .map_err(|source| ServerError::HookFailed {
                        event: SessionEvent::Auth,
                        source,
                    })?;
                tracing::info!("[{}] Authenticated as '{}'", session.peer, session.user());
                ok(sync)
            }
            Request::Join {
                instance_uuid,
                replica_id,
                vclock,
            } => {
                self.require(session, Action::Replication)?;
                self.require_bootstrapped()?;
                return Ok(Outcome::Join {
                    sync,
                    instance_uuid,
                    replica_id,
                    vclock,
                });
            }
            Request::Subscribe {
                instance_uuid,
                replica_id,
                vclock,
            } => {
                self.require(session, Action::Replication)?;
                self.require_bootstrapped()?;
                if replica_id == 0 || replica_id == self.engine.instance_id() {
                    return Err(ServerError::InvalidRequest(format!(
                        "replica id {replica_id} is reserved or belongs to this instance"
                    )));
                }
                return Ok(Outcome::Subscribe {
                    sync,
                    instance_uuid,
                    replica_id,
                    vclock,
                });
            }
        };
        Ok(Outcome::Reply(reply))
    }

    fn require(&self, session: &Session, action: Action) -> Result<(), ServerError> {
        if self.access.check_capability(session.user(), action) {
            Ok(())
        } else {
            Err(ServerError::AccessDenied {
                user: session.user().to_string(),
                action,
            })
        }
    }

    fn require_bootstrapped(&self) -> Result<(), ServerError> {
        if self.engine.is_bootstrapped() {
            Ok(())
        } else {
            Err(ServerError::NotBootstrapped)
        }
    }

    fn status(&self) -> Value {
        let replicas: Vec<Value> = self
            .replication
            .list()
            .into_iter()
            .map(|s| {
                map(vec![
                    ("id", Value::from(s.id)),
                    ("role", Value::from(format!("{:?}", s.role).to_lowercase())),
                    ("peer", Value::from(s.peer)),
                    ("phase", Value::from(s.phase.as_str())),
                    (
                        "replica_id",
                        s.replica_id.map(Value::from).unwrap_or(Value::Nil),
                    ),
                    ("vclock", s.vclock.to_value()),
                    (
                        "last_error",
                        s.last_error.map(Value::from).unwrap_or(Value::Nil),
                    ),
                ])
            })
            .collect();

        map(vec![
            ("instance_id", Value::from(self.engine.instance_id())),
            ("uuid", Value::from(self.instance_uuid.to_string())),
            ("version", Value::from(env!("CARGO_PKG_VERSION"))),
            ("vclock", self.engine.vclock().to_value()),
            ("durable_vclock", self.engine.durable_vclock().to_value()),
            ("bootstrapped", Value::from(self.engine.is_bootstrapped())),
            ("spaces", Value::from(self.engine.spaces().len() as u64)),
            ("tuples", Value::from(self.engine.tuple_count() as u64)),
            ("replication", Value::Array(replicas)),
        ])
    }
}

fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::from(k), v))
            .collect(),
    )
}
