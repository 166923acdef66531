//! Session registry
//!
//! The single shared set of live sessions. Connection handlers insert and remove their
//! own session; the monitoring API reads snapshots and asks sessions to stop.

use crate::protocol::SessionConfig;
use crate::session::{Session, SessionId, StopReason};
use live_relay_config::AdmissionPolicy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Error type for registry operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("server at capacity ({max} sessions)")]
    AtCapacity { max: usize },

    #[error("session {0} not found")]
    NotFound(SessionId),
}

/// Shared registry handle
pub type SharedRegistry = Arc<Registry>;

/// Authoritative in-memory set of live sessions
#[derive(Debug)]
pub struct Registry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
    max_sessions: usize,
    admission: AdmissionPolicy,
}

impl Registry {
    pub fn new(max_sessions: usize, admission: AdmissionPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_sessions,
            admission,
        }
    }

    pub fn shared(max_sessions: usize, admission: AdmissionPolicy) -> SharedRegistry {
        Arc::new(Self::new(max_sessions, admission))
    }

    /// Configured fleet capacity
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Create and insert a session for a validated handshake
    ///
    /// Under [`AdmissionPolicy::Reject`] every registered session (whatever its state)
    /// counts toward the capacity.
    pub async fn register(&self, config: SessionConfig) -> Result<Arc<Session>, RegistryError> {
        let mut sessions = self.sessions.write().await;
        if self.admission == AdmissionPolicy::Reject && sessions.len() >= self.max_sessions {
            return Err(RegistryError::AtCapacity {
                max: self.max_sessions,
            });
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(id, config));
        sessions.insert(id, session.clone());
        Ok(session)
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Remove a session; removing an absent id is a no-op
    pub async fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(&id)
    }

    /// All registered sessions ordered by id
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut list: Vec<_> = self.sessions.read().await.values().cloned().collect();
        list.sort_by_key(|s| s.id);
        list
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Sessions in `STREAMING` or `RECONNECTING`
    pub async fn active_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.state().is_active())
            .count()
    }

    /// Ask one session to stop
    ///
    /// The session stays registered (and counted for admission) until its connection
    /// handler has torn the transcoder down and removes it. A session that is already
    /// stopping reports [`RegistryError::NotFound`].
    pub async fn stop(&self, id: SessionId, reason: StopReason) -> Result<(), RegistryError> {
        let session = self.get(id).await.ok_or(RegistryError::NotFound(id))?;
        if !session.request_stop(reason) {
            return Err(RegistryError::NotFound(id));
        }
        tracing::info!(session_id = %id, reason = reason.message(), "session stop requested");
        Ok(())
    }

    /// Ask every session to stop, returning how many were not already stopping
    pub async fn stop_all(&self, reason: StopReason) -> usize {
        let stopped = self
            .snapshot()
            .await
            .iter()
            .filter(|session| session.request_stop(reason))
            .count();
        if stopped > 0 {
            tracing::info!(count = stopped, reason = reason.message(), "stopping all sessions");
        }
        stopped
    }
}
