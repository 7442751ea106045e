//! Process-wide set of live sessions

use super::session::{Session, SessionId};
use crate::{Error, Result};
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Live sessions, used for lookup and bulk shutdown.
///
/// Cloning shares the same set.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    closing: bool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Refused once [`close_all`](Self::close_all) has begun.
    pub fn register(&self, session: Session) -> Result<()> {
        let mut state = self.inner.write();
        if state.closing {
            return Err(Error::ShuttingDown);
        }
        let id = session.id().clone();
        state.sessions.insert(id.clone(), session);
        debug!("Registered session {} ({} live)", id, state.sessions.len());
        Ok(())
    }

    /// Remove a session; `None` if it was not registered
    pub fn unregister(&self, id: &SessionId) -> Option<Session> {
        let mut state = self.inner.write();
        let removed = state.sessions.remove(id);
        if removed.is_some() {
            debug!("Unregistered session {} ({} live)", id, state.sessions.len());
        }
        removed
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.inner.read().sessions.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.inner.read().sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }

    /// Whether shutdown has begun
    pub fn is_closing(&self) -> bool {
        self.inner.read().closing
    }

    /// Close every live session and stop accepting new ones.
    ///
    /// Sessions are taken out under the lock and closed outside it, so a
    /// session tearing itself down concurrently only waits on its own release.
    ///
    /// ```
    /// # tokio_test::block_on(async {
    /// use mirrorcast_webrtc::SessionRegistry;
    ///
    /// let registry = SessionRegistry::new();
    /// registry.close_all().await;
    /// assert!(registry.is_closing());
    /// assert!(registry.is_empty());
    /// # });
    /// ```
    pub async fn close_all(&self) {
        let sessions: Vec<Session> = {
            let mut state = self.inner.write();
            state.closing = true;
            state.sessions.drain().map(|(_, session)| session).collect()
        };

        if sessions.is_empty() {
            info!("No live sessions to close");
            return;
        }

        info!("Closing {} session(s)", sessions.len());
        join_all(sessions.iter().map(|session| session.close())).await;
        info!("All sessions closed");
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.read();
        f.debug_struct("SessionRegistry")
            .field("sessions", &state.sessions.len())
            .field("closing", &state.closing)
            .finish()
    }
}
