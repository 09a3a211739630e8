use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use natbridge_proto::{PortType, Role};
use natbridge_store::SessionStore;
use parking_lot::Mutex;
use thiserror::Error;

use crate::session::{PeerEntry, Session};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("session '{0}' not found")]
    SessionNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registration {
    pub is_new_peer: bool,
    pub session_ready: bool,
    pub address_changed: bool,
}

/// Live sessions keyed by id.
///
/// Every operation takes the one registry lock for its whole duration;
/// callers get copies, never references into the table.
pub struct PeerRegistry {
    store: Arc<dyn SessionStore>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl PeerRegistry {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_peer(
        &self,
        session_id: &str,
        role: Role,
        port_type: PortType,
        addr: SocketAddr,
    ) -> Result<Registration, RegistrationError> {
        self.register_peer_at(session_id, role, port_type, addr, Instant::now())
    }

    pub fn register_peer_at(
        &self,
        session_id: &str,
        role: Role,
        port_type: PortType,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<Registration, RegistrationError> {
        let mut sessions = self.sessions.lock();

        if !self.store.exists(session_id) {
            return Err(RegistrationError::SessionNotFound(session_id.to_string()));
        }

        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id, now));
        let announced = session.register(role, port_type, addr, now);

        Ok(Registration {
            is_new_peer: announced.is_new_peer,
            session_ready: session.is_ready(),
            address_changed: announced.address_changed,
        })
    }

    /// Snapshot of the streamer and viewer sockets of a session.
    /// Empty for unknown ids.
    pub fn get_session_peers(&self, session_id: &str) -> HashMap<Role, HashMap<PortType, PeerEntry>> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|session| session.roles.clone())
            .unwrap_or_default()
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Last announcement time of every live session.
    pub fn last_announcements(&self) -> Vec<(String, Instant)> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, session)| (id.clone(), session.last_announcement_at))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes the given sessions. Which sessions count as expired is
    /// decided by the caller.
    pub fn remove_expired_sessions(&self, session_ids: &HashSet<String>) {
        for id in self.remove_sessions(session_ids) {
            log::info!("{}: Removed expired session", id);
        }
    }

    /// Like [`remove_expired_sessions`](Self::remove_expired_sessions) but
    /// keeps any session announced after `cutoff`, checked under the lock.
    /// Returns the ids actually removed.
    pub fn remove_sessions_idle_since(
        &self,
        session_ids: &HashSet<String>,
        cutoff: Instant,
    ) -> HashSet<String> {
        let mut sessions = self.sessions.lock();
        let idle: HashSet<String> = session_ids
            .iter()
            .filter(|id| {
                sessions
                    .get(id.as_str())
                    .is_some_and(|session| session.last_announcement_at < cutoff)
            })
            .cloned()
            .collect();
        for id in &idle {
            sessions.remove(id);
            log::info!("{}: Removed expired session", id);
        }
        idle
    }

    /// Runs `f` on a live session with the registry locked, so a sweep cannot
    /// remove it meanwhile. `None` if the session is gone.
    pub fn with_session<R>(&self, session_id: &str, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.sessions.lock().get(session_id).map(f)
    }

    /// Deletes sessions whose addresses were taken over by another session.
    pub fn remove_displaced_sessions(&self, session_ids: &HashSet<String>) {
        for id in self.remove_sessions(session_ids) {
            log::info!("{}: Removed displaced session", id);
        }
    }

    fn remove_sessions(&self, session_ids: &HashSet<String>) -> Vec<String> {
        let mut sessions = self.sessions.lock();
        session_ids
            .iter()
            .filter(|id| sessions.remove(id.as_str()).is_some())
            .cloned()
            .collect()
    }
}
