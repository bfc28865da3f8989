//! Connection sessions.

use crate::auth::GUEST;
use crate::error::ServerError;
use crate::triggers::SessionInfo;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted; the greeting has not been sent yet.
    AwaitingGreeting,
    /// Serving request/response traffic.
    Ready,
    /// Streaming a snapshot to a joining replica.
    Joining,
    /// Relaying the log to a subscribed replica. Terminal apart from close.
    Subscribing,
    Closed,
}

impl SessionState {
    fn can_move_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (AwaitingGreeting, Ready | Closed)
                | (Ready, Joining | Subscribing | Closed)
                | (Joining, Ready | Closed)
                | (Subscribing, Closed)
        )
    }
}

/// A client session.
#[derive(Debug)]
pub struct Session {
    /// Unique session ID.
    pub id: u64,

    /// Remote address.
    pub peer: SocketAddr,

    state: SessionState,

    /// Authenticated user; `guest` until a successful `AUTH`.
    user: String,

    request_count: u64,

    created_at: Instant,

    last_activity: Instant,
}

impl Session {
    /// Creates a new session.
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer,
            state: SessionState::AwaitingGreeting,
            user: GUEST.to_string(),
            request_count: 0,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Moves the session to `next`, rejecting transitions the lifecycle does
    /// not allow.
    pub fn transition(&mut self, next: SessionState) -> Result<(), ServerError> {
        if self.state == next && next == SessionState::Closed {
            return Ok(());
        }
        if !self.state.can_move_to(next) {
            return Err(ServerError::InvalidSessionState {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!("Session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn set_user(&mut self, user: impl Into<String>) {
        self.user = user.into();
    }

    /// Snapshot handed to session hooks.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            peer: self.peer,
            user: self.user.clone(),
        }
    }

    /// Records a request.
    pub fn record_request(&mut self) {
        self.request_count += 1;
        self.last_activity = Instant::now();
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
