//! # rippledb-server
//!
//! TCP server for rippledb.
//!
//! This crate provides:
//! - Connection handling: greeting, framing, request dispatch, error replies
//! - Session state and connect/disconnect/auth hooks
//! - Token-based authentication and per-user grants
//! - Master-side relay (JOIN snapshot, SUBSCRIBE log streaming)
//! - Replica-side applier with reconnect and a start timeout
//! - Prometheus metrics and YAML/env configuration

pub mod applier;
pub mod auth;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod relay;
pub mod replication;
pub mod server;
pub mod session;
pub mod triggers;

pub use applier::{Applier, ApplierConfig, ApplierHandle, ApplierState, ApplierStatus};
pub use auth::{AccessControl, Action, Grants, TokenValidator};
pub use config::{
    AuthConfig, Config, ConfigError, InstanceConfig, MetricsConfig, NetworkConfig,
    ReplicationConfig, StorageConfig,
};
pub use error::{ReplicationError, ServerError};
pub use handler::{Outcome, RequestHandler};
pub use metrics::{run_metrics_server, Metrics};
pub use relay::{Relay, Subscriber};
pub use replication::{ReplicationPhase, ReplicationRegistry, ReplicationSession, Role};
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{Session, SessionState};
pub use triggers::{HookError, HookId, SessionEvent, SessionInfo, TriggerRegistry};
