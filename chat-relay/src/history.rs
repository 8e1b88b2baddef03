//! Message history collaborator.
//!
//! History is best effort: the router logs failures from these calls and
//! carries on with live delivery.

use std::{collections::HashMap, fmt, io, path::PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::envelope::Envelope;

/// Where a message is filed: a room, or a two-party conversation whose key
/// does not depend on who spoke first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Room(String),
    Conversation { first: String, second: String },
}

impl Scope {
    pub fn room(name: impl Into<String>) -> Self {
        Scope::Room(name.into())
    }

    pub fn conversation(a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Scope::Conversation {
            first: first.to_string(),
            second: second.to_string(),
        }
    }

    fn file_name(&self) -> String {
        match self {
            Scope::Room(name) => format!("room_{}.json", sanitize(name)),
            Scope::Conversation { first, second } => {
                format!("dm_{}_{}.json", sanitize(first), sanitize(second))
            }
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Room(name) => write!(f, "room {name}"),
            Scope::Conversation { first, second } => write!(f, "conversation {first}/{second}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("history file is not valid JSON: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, scope: &Scope, message: &Envelope) -> Result<(), HistoryError>;

    /// All messages filed under `scope`, oldest first.
    async fn history(&self, scope: &Scope) -> Result<Vec<Envelope>, HistoryError>;
}

#[derive(Default)]
pub struct MemoryHistory {
    scopes: Mutex<HashMap<Scope, Vec<Envelope>>>,
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn append(&self, scope: &Scope, message: &Envelope) -> Result<(), HistoryError> {
        let mut scopes = self.scopes.lock().await;
        scopes.entry(scope.clone()).or_default().push(message.clone());
        Ok(())
    }

    async fn history(&self, scope: &Scope) -> Result<Vec<Envelope>, HistoryError> {
        let scopes = self.scopes.lock().await;
        Ok(scopes.get(scope).cloned().unwrap_or_default())
    }
}

/// Keeps one JSON array per scope under `dir`, rewritten on every append.
pub struct JsonFileHistory {
    dir: PathBuf,
    cache: Mutex<HashMap<Scope, Vec<Envelope>>>,
}

impl JsonFileHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn load(&self, scope: &Scope) -> Result<Vec<Envelope>, HistoryError> {
        let path = self.dir.join(scope.file_name());
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let messages: Vec<Envelope> = serde_json::from_slice(&bytes)?;
                debug!(%scope, count = messages.len(), "loaded history");
                Ok(messages)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl HistoryStore for JsonFileHistory {
    async fn append(&self, scope: &Scope, message: &Envelope) -> Result<(), HistoryError> {
        let mut cache = self.cache.lock().await;
        if !cache.contains_key(scope) {
            let loaded = self.load(scope).await?;
            cache.insert(scope.clone(), loaded);
        }
        let messages = cache.entry(scope.clone()).or_default();
        messages.push(message.clone());

        let encoded = serde_json::to_vec(messages)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(scope.file_name()), encoded).await?;
        Ok(())
    }

    async fn history(&self, scope: &Scope) -> Result<Vec<Envelope>, HistoryError> {
        let mut cache = self.cache.lock().await;
        if let Some(messages) = cache.get(scope) {
            return Ok(messages.clone());
        }
        let loaded = self.load(scope).await?;
        cache.insert(scope.clone(), loaded.clone());
        Ok(loaded)
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
