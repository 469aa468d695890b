//! Tracks concurrent upload sessions by id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::session::UploadSession;

/// Sessions of one host, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<UploadSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session and returns the shared handle.
    pub fn register(&self, session: UploadSession) -> Arc<UploadSession> {
        let session = Arc::new(session);
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.id().to_string(), session.clone());
        debug!(session = %session.id(), "session registered");
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<UploadSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<UploadSession>> {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions not yet in a terminal state.
    pub fn active(&self) -> Vec<Arc<UploadSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| !s.status().is_terminal())
            .cloned()
            .collect()
    }

    /// Cancels every cancellable session; returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        self.active().iter().filter(|s| s.cancel()).count()
    }

    /// Drops sessions in a terminal state.
    pub fn prune(&self) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, s| !s.status().is_terminal());
        before - sessions.len()
    }
}
