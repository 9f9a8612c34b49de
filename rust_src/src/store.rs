//! Session storage with one lock per session.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::session::{SessionId, SessionState};

/// Exclusive access to one session's state.
pub type SessionHandle = Arc<Mutex<SessionState>>;

pub trait SessionStore: Send + Sync {
    fn put(&self, state: SessionState) -> SessionHandle;

    fn get(&self, id: &str) -> Option<SessionHandle>;

    fn delete(&self, id: &str) -> Option<SessionHandle>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn new_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<SessionId, SessionHandle>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn put(&self, state: SessionState) -> SessionHandle {
        let id = state.id.clone();
        let handle = Arc::new(Mutex::new(state));
        self.sessions.insert(id, handle.clone());
        handle
    }

    fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    fn delete(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.remove(id).map(|(_, handle)| handle)
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}
