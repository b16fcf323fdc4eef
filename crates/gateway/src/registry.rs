//! Registry of connected client sessions.
//!
//! Transport adapters insert a session when they accept a client and remove
//! it when the client goes away. Readers (the status endpoint, scripts) work
//! from [`SessionRegistry::snapshot`], which never holds a lock past its own
//! return.

use std::{
    fmt,
    net::IpAddr,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use {dashmap::DashMap, tracing::debug};

use crate::hooks::{Hooks, SessionStateChanged};

pub type SessionId = u64;

/// Where a session is in its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Registered,
    Ending,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Registered => "registered",
            Self::Ending => "ending",
        })
    }
}

/// The IRC server a session is (or will be) connected to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Upstream {
    pub hostname: String,
    pub port: u16,
}

/// Mutable part of a session, updated by its transport adapter.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub upstream: Upstream,
    pub state: SessionState,
    pub nick: String,
    pub username: String,
    pub remote_hostname: String,
}

/// One connected client.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub remote_addr: IpAddr,
    pub connected_at: Instant,
    status: RwLock<SessionStatus>,
}

impl Session {
    pub fn new(id: SessionId, remote_addr: IpAddr) -> Self {
        Self {
            id,
            remote_addr,
            connected_at: Instant::now(),
            status: RwLock::new(SessionStatus {
                remote_hostname: remote_addr.to_string(),
                ..SessionStatus::default()
            }),
        }
    }

    /// Copy of the current status.
    pub fn status(&self) -> SessionStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut SessionStatus)) {
        f(&mut self.status.write().unwrap_or_else(PoisonError::into_inner));
    }

    /// `host:port state nick!username remote_addr remote_hostname`
    pub fn status_line(&self) -> String {
        let status = self.status();
        format!(
            "{}:{} {} {}!{} {} {}",
            status.upstream.hostname,
            status.upstream.port,
            status.state,
            status.nick,
            status.username,
            self.remote_addr,
            status.remote_hostname,
        )
    }
}

/// Concurrent id → session map. No caller-side locking is needed.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    next_id: AtomicU64,
    hooks: Arc<Hooks>,
}

impl SessionRegistry {
    pub fn new(hooks: Arc<Hooks>) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(0),
            hooks,
        }
    }

    /// Allocate a fresh session id.
    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add a session, replacing (and returning) any entry with the same id.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let previous = self.sessions.insert(session.id, Arc::clone(&session));
        debug!(session = session.id, remote = %session.remote_addr, "session registered");

        self.hooks.dispatch(&mut SessionStateChanged {
            session,
            connected: true,
            halt: false,
        });
        previous
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(&id)?;
        debug!(session = id, "session removed");

        self.hooks.dispatch(&mut SessionStateChanged {
            session: Arc::clone(&session),
            connected: false,
            halt: false,
        });
        Some(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Point-in-time copy of every registered session, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }
}
