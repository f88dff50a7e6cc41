//! Process-wide table of live sessions

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use tokio::sync::{mpsc, RwLock};
use tracing::info;

use super::{transport::SessionTransport, Session, SessionError, SessionId, SessionInit};

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    close_events: mpsc::UnboundedSender<SessionId>,
}

/// Close notifications emitted by session transports, in the order they were released.
pub struct CloseEvents {
    receiver: mpsc::UnboundedReceiver<SessionId>,
}

impl CloseEvents {
    pub async fn next(&mut self) -> Option<SessionId> {
        self.receiver.recv().await
    }
}

/// Store handle that does not keep the sessions alive.
#[derive(Clone)]
pub struct WeakSessionStore {
    inner: Weak<StoreInner>,
}

impl WeakSessionStore {
    pub fn upgrade(&self) -> Option<SessionStore> {
        self.inner.upgrade().map(|inner| SessionStore { inner })
    }
}

impl SessionStore {
    pub fn new() -> (Self, CloseEvents) {
        let (close_events, receiver) = mpsc::unbounded_channel();
        let store = Self {
            inner: Arc::new(StoreInner {
                sessions: RwLock::new(HashMap::new()),
                close_events,
            }),
        };
        (store, CloseEvents { receiver })
    }

    pub fn downgrade(&self) -> WeakSessionStore {
        WeakSessionStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Creates and registers a new ACTIVE session under a fresh identifier.
    pub async fn create(&self, init: SessionInit) -> Arc<Session> {
        let mut sessions = self.inner.sessions.write().await;

        let mut id = SessionId::generate();
        while sessions.contains_key(&id) {
            id = SessionId::generate();
        }

        let transport = SessionTransport::new(id.clone(), self.inner.close_events.clone());
        let session = Arc::new(Session::new(id.clone(), init, transport));
        sessions.insert(id, session.clone());

        info!(
            session_id = %session.id(),
            protocol_version = %session.protocol_version(),
            client = session.client_name().unwrap_or("unknown"),
            live_sessions = sessions.len(),
            "session created"
        );
        session
    }

    pub async fn lookup(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(id)
            .filter(|session| !session.transport().is_closed())
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Removes the session and releases its transport. Removing an absent id is a no-op.
    ///
    /// Returns whether a session was removed.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.inner.sessions.write().await.remove(id);
        let Some(session) = removed else {
            return false;
        };

        session.transport().close();
        info!(session_id = %session.id(), "session removed");
        true
    }

    /// Removes every session, releasing their transports.
    pub async fn close_all(&self) -> usize {
        let drained = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect::<Vec<_>>()
        };

        for session in &drained {
            session.transport().close();
        }
        drained.len()
    }

    /// Number of stored sessions. May briefly include a session whose transport closed but
    /// whose close notification has not been reaped yet.
    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
