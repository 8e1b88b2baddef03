use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::session::{Session, SessionId};

/// Logged-in usernames and the one live session behind each.
///
/// Every change goes through a single lock, so a login racing the cleanup
/// of an older session for the same name always resolves one way: the
/// cleanup only removes an entry that still points at its own session.
#[derive(Default)]
pub struct Directory {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Directory {
    /// Installs `session` under `username` and hands back whichever session
    /// held the name before, so the caller can evict it.
    pub async fn register(&self, username: &str, session: Arc<Session>) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        let previous = sessions.insert(username.to_string(), session);
        if let Some(previous) = &previous {
            info!(%username, evicted = previous.id(), "username already active, replacing session");
        }
        previous
    }

    pub async fn lookup(&self, username: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(username).cloned()
    }

    /// Removes `username` only if it still maps to session `id`.
    pub async fn remove(&self, username: &str, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(username) {
            Some(current) if current.id() == id => {
                sessions.remove(username);
                debug!(%username, session = id, "removed from directory");
                true
            }
            _ => false,
        }
    }

    pub async fn online(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}
