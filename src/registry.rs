//! Process-wide map from connection id to live session.
//!
//! The registry is the only process-wide shared state. It enforces the
//! single-holder rule: at most one non-closed [`Session`] per connection id.
//! Contention is low (one registration per tunnel lifetime plus one lookup
//! per public request), so a plain map behind a short-lived lock is enough.

use std::collections::{hash_map::Entry, HashMap};
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::session::{CloseCause, Session};

/// A second live session tried to claim an id that is already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnIdInUse;

impl std::fmt::Display for ConnIdInUse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection id in use")
    }
}

impl std::error::Error for ConnIdInUse {}

/// Connection id → session map.
#[derive(Default)]
pub struct TunnelRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically insert the session unless a live one already holds its id.
    /// A leftover entry whose session has fully closed is replaced. On
    /// success the session becomes Active.
    pub fn try_register(&self, session: Arc<Session>) -> Result<(), ConnIdInUse> {
        let mut sessions = self.sessions.write().expect("registry lock");
        match sessions.entry(session.conn_id()) {
            Entry::Occupied(mut entry) => {
                if entry.get().state() == crate::session::SessionState::Closed {
                    session.mark_active();
                    entry.insert(session);
                    Ok(())
                } else {
                    Err(ConnIdInUse)
                }
            }
            Entry::Vacant(entry) => {
                session.mark_active();
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// The session currently holding `conn_id`, if any.
    pub fn lookup(&self, conn_id: Uuid) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("registry lock")
            .get(&conn_id)
            .cloned()
    }

    /// Remove the entry for `conn_id` only if it still holds this exact
    /// session, so a late-closing predecessor cannot evict its successor.
    pub fn unregister(&self, conn_id: Uuid, session: &Session) {
        let mut sessions = self.sessions.write().expect("registry lock");
        if let Some(current) = sessions.get(&conn_id) {
            if std::ptr::eq(Arc::as_ptr(current), session) {
                sessions.remove(&conn_id);
            }
        }
    }

    /// Drain every registered session (server shutdown). Returns how many
    /// sessions were drained.
    pub fn drain_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .read()
            .expect("registry lock")
            .values()
            .cloned()
            .collect();
        for session in &sessions {
            session.drain(CloseCause::Shutdown);
        }
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().expect("registry lock").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CloseCause, SessionState};
    use tokio::sync::mpsc;

    fn session_for(registry: &Arc<TunnelRegistry>, conn_id: Uuid) -> Arc<Session> {
        let (tx, rx) = mpsc::channel(16);
        // Writer task stand-in: keep the channel open for the session's life.
        std::mem::forget(rx);
        Session::new(conn_id, tx, registry.clone())
    }

    #[tokio::test]
    async fn second_registration_is_rejected() {
        let registry = Arc::new(TunnelRegistry::new());
        let conn_id = Uuid::new_v4();
        let first = session_for(&registry, conn_id);
        let second = session_for(&registry, conn_id);

        assert!(registry.try_register(first.clone()).is_ok());
        assert_eq!(first.state(), SessionState::Active);
        assert_eq!(registry.try_register(second.clone()), Err(ConnIdInUse));
        assert_eq!(second.state(), SessionState::Registering);
    }

    #[tokio::test]
    async fn closed_entry_is_replaced() {
        let registry = Arc::new(TunnelRegistry::new());
        let conn_id = Uuid::new_v4();
        let first = session_for(&registry, conn_id);
        registry.try_register(first.clone()).unwrap();

        first.drain(CloseCause::PeerClosed);
        assert!(registry.lookup(conn_id).is_none());

        let second = session_for(&registry, conn_id);
        assert!(registry.try_register(second.clone()).is_ok());
        let current = registry.lookup(conn_id).unwrap();
        assert!(std::ptr::eq(
            Arc::as_ptr(&current),
            Arc::as_ptr(&second)
        ));
    }

    #[tokio::test]
    async fn stale_unregister_cannot_evict_successor() {
        let registry = Arc::new(TunnelRegistry::new());
        let conn_id = Uuid::new_v4();
        let first = session_for(&registry, conn_id);
        registry.try_register(first.clone()).unwrap();
        first.drain(CloseCause::PeerClosed);

        let second = session_for(&registry, conn_id);
        registry.try_register(second.clone()).unwrap();

        // A late unregister from the dead predecessor must be a no-op.
        registry.unregister(conn_id, &first);
        let current = registry.lookup(conn_id).unwrap();
        assert!(std::ptr::eq(
            Arc::as_ptr(&current),
            Arc::as_ptr(&second)
        ));
    }

    #[tokio::test]
    async fn drain_all_empties_the_registry() {
        let registry = Arc::new(TunnelRegistry::new());
        let a = session_for(&registry, Uuid::new_v4());
        let b = session_for(&registry, Uuid::new_v4());
        registry.try_register(a.clone()).unwrap();
        registry.try_register(b.clone()).unwrap();

        assert_eq!(registry.drain_all(), 2);
        assert!(registry.is_empty());
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(b.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn lookup_miss_returns_none() {
        let registry = TunnelRegistry::new();
        assert!(registry.lookup(Uuid::new_v4()).is_none());
    }
}
