//! Session-event hooks.
//!
//! Hooks are process-wide: the registry is shared by every connection and
//! may be changed while sessions are being created. Firing works on a copy
//! of the hook list taken under the read lock, so a concurrent register or
//! unregister never affects a fire that is already running.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// After the greeting was sent, before any request is read.
    Connect,
    /// After the session closed.
    Disconnect,
    /// After a successful `AUTH`.
    Auth,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionEvent::Connect => "connect",
            SessionEvent::Disconnect => "disconnect",
            SessionEvent::Auth => "auth",
        };
        f.write_str(name)
    }
}

/// What a hook gets to see about the session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: u64,
    pub peer: SocketAddr,
    pub user: String,
}

/// Failure raised by a hook.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A session-event callback.
pub type Hook = Arc<dyn Fn(&SessionInfo) -> Result<(), HookError> + Send + Sync>;

/// Handle returned by [`TriggerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Ordered hooks per event.
#[derive(Default)]
pub struct TriggerRegistry {
    hooks: RwLock<HashMap<SessionEvent, Vec<(HookId, Hook)>>>,
    next_id: AtomicU64,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook for `event`.
    pub fn register<F>(&self, event: SessionEvent, hook: F) -> HookId
    where
        F: Fn(&SessionInfo) -> Result<(), HookError> + Send + Sync + 'static,
    {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.hooks
            .write()
            .entry(event)
            .or_default()
            .push((id, Arc::new(hook)));
        tracing::debug!("Registered {} hook {:?}", event, id);
        id
    }

    /// Removes a hook. Returns false if it was not registered for `event`.
    pub fn unregister(&self, event: SessionEvent, id: HookId) -> bool {
        let mut hooks = self.hooks.write();
        let Some(list) = hooks.get_mut(&event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hook_id, _)| *hook_id != id);
        list.len() != before
    }

    /// Number of hooks registered for `event`.
    pub fn count(&self, event: SessionEvent) -> usize {
        self.hooks.read().get(&event).map_or(0, Vec::len)
    }

    /// Runs the hooks for `event` in registration order, stopping at the
    /// first failure.
    pub fn fire(&self, event: SessionEvent, info: &SessionInfo) -> Result<(), HookError> {
        let hooks: Vec<Hook> = match self.hooks.read().get(&event) {
            Some(list) => list.iter().map(|(_, hook)| Arc::clone(hook)).collect(),
            None => return Ok(()),
        };
        for hook in hooks {
            hook(info)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.hooks.read();
        let mut map = f.debug_map();
        for (event, list) in hooks.iter() {
            map.entry(event, &list.len());
        }
        map.finish()
    }
}
