//! Registry of live replication sessions.
//!
//! Relays (master side) and appliers (replica side) record their phase,
//! the last vclock they saw and their last error here. `STATUS` and the
//! metrics endpoint read cloned snapshots.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rippledb_protocol::{ReplicaId, Vclock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Which end of the stream this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Serving JOIN/SUBSCRIBE to a replica.
    Master,
    /// Pulling from a master.
    Replica,
}

/// Phase of a replication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationPhase {
    Greeting,
    Joining,
    Subscribing,
    Closed,
}

impl ReplicationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationPhase::Greeting => "greeting",
            ReplicationPhase::Joining => "joining",
            ReplicationPhase::Subscribing => "subscribing",
            ReplicationPhase::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationSession {
    pub id: u64,
    pub role: Role,
    pub peer: String,
    pub phase: ReplicationPhase,
    /// For a master, the replica's last acknowledged vclock; for a replica,
    /// the vclock it has applied.
    #[serde(skip)]
    pub vclock: Vclock,
    pub replica_id: Option<ReplicaId>,
    pub instance_uuid: Option<Uuid>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ReplicationRegistry {
    sessions: DashMap<u64, ReplicationSession>,
    next_id: AtomicU64,
}

impl ReplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session and returns its id.
    pub fn open(&self, role: Role, peer: impl Into<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.insert(
            id,
            ReplicationSession {
                id,
                role,
                peer: peer.into(),
                phase: ReplicationPhase::Greeting,
                vclock: Vclock::new(),
                replica_id: None,
                instance_uuid: None,
                last_error: None,
                updated_at: Utc::now(),
            },
        );
        id
    }

    fn update(&self, id: u64, f: impl FnOnce(&mut ReplicationSession)) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            f(&mut session);
            session.updated_at = Utc::now();
        }
    }

    pub fn set_phase(&self, id: u64, phase: ReplicationPhase) {
        self.update(id, |s| s.phase = phase);
    }

    pub fn set_vclock(&self, id: u64, vclock: Vclock) {
        self.update(id, |s| s.vclock = vclock);
    }

    pub fn set_error(&self, id: u64, error: impl Into<String>) {
        let error = error.into();
        self.update(id, |s| s.last_error = Some(error));
    }

    pub fn set_peer(&self, id: u64, peer: impl Into<String>) {
        let peer = peer.into();
        self.update(id, |s| s.peer = peer);
    }

    pub fn set_replica(&self, id: u64, replica_id: ReplicaId, instance_uuid: Uuid) {
        self.update(id, |s| {
            s.replica_id = Some(replica_id);
            s.instance_uuid = Some(instance_uuid);
        });
    }

    pub fn remove(&self, id: u64) -> Option<ReplicationSession> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    pub fn get(&self, id: u64) -> Option<ReplicationSession> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Snapshot of all sessions ordered by id.
    pub fn list(&self) -> Vec<ReplicationSession> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn count(&self, role: Role) -> usize {
        self.sessions.iter().filter(|s| s.role == role).count()
    }
}
