//! Conversation sessions keyed by repository and session name.

use std::sync::Arc;

use agent::{Conversation, ConversationHandle, spawn_conversation};
use dashmap::DashMap;
use tools::RepoScope;
use tracing::info;

/// Session name used when a client does not pick one.
pub const DEFAULT_SESSION: &str = "default";

/// Builds a fresh conversation bound to one repository.
pub trait ConversationFactory: Send + Sync {
    fn create(&self, scope: RepoScope) -> Conversation;
}

struct SessionEntry {
    handle: ConversationHandle,
    clients: usize,
}

/// Running conversations: `owner/repo#session` -> actor handle.
///
/// A session lives while at least one client holds a [`SessionLease`].
pub struct SessionManager {
    factory: Arc<dyn ConversationFactory>,
    sessions: DashMap<String, SessionEntry>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn ConversationFactory>) -> Self {
        Self {
            factory,
            sessions: DashMap::new(),
        }
    }

    /// `owner/repo#session`.
    pub fn session_key(scope: &RepoScope, session: &str) -> String {
        format!("{}#{session}", scope.full_name())
    }

    /// Joins the session's conversation, starting one if none is running.
    pub fn connect(self: &Arc<Self>, scope: RepoScope, session: &str) -> SessionLease {
        let key = Self::session_key(&scope, session);
        let mut entry = self.sessions.entry(key.clone()).or_insert_with(|| {
            info!(session = %key, "Starting conversation");
            SessionEntry {
                handle: spawn_conversation(self.factory.create(scope.clone())),
                clients: 0,
            }
        });
        if entry.handle.is_closed() {
            info!(session = %key, "Restarting stopped conversation");
            entry.handle = spawn_conversation(self.factory.create(scope));
        }
        entry.clients += 1;
        let handle = entry.handle.clone();
        drop(entry);
        SessionLease {
            manager: Arc::clone(self),
            key,
            handle,
        }
    }

    /// Drops one client; the last one out removes the session, which stops
    /// the actor once its queued commands are done.
    fn release(&self, key: &str) {
        if let Some(mut entry) = self.sessions.get_mut(key) {
            entry.clients = entry.clients.saturating_sub(1);
        }
        if self
            .sessions
            .remove_if(key, |_, entry| entry.clients == 0)
            .is_some()
        {
            info!(session = %key, "Last client left, session closed");
        }
    }

    pub fn get(&self, key: &str) -> Option<ConversationHandle> {
        self.sessions.get(key).map(|e| e.handle.clone())
    }

    /// Connected clients of a session.
    pub fn clients(&self, key: &str) -> usize {
        self.sessions.get(key).map_or(0, |e| e.clients)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// One client's membership in a session. Dropping it releases the session.
pub struct SessionLease {
    manager: Arc<SessionManager>,
    key: String,
    handle: ConversationHandle,
}

impl SessionLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn handle(&self) -> &ConversationHandle {
        &self.handle
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.manager.release(&self.key);
    }
}
