use std::{
    io,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("'{0}' is not a usable file name")]
    InvalidName(String),

    #[error("failed to store file: {0}")]
    Io(#[from] io::Error),
}

/// Destination for reassembled uploads.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Writes `bytes` and returns where they ended up. `destination` groups
    /// uploads, e.g. by room.
    async fn save_assembled(
        &self,
        bytes: &[u8],
        filename: &str,
        destination: &str,
    ) -> Result<PathBuf, StorageError>;
}

/// Stores uploads as `<root>/<destination>/<filename>`.
#[derive(Debug, Clone)]
pub struct DiskFileStore {
    root: PathBuf,
}

impl DiskFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn save_assembled(
        &self,
        bytes: &[u8],
        filename: &str,
        destination: &str,
    ) -> Result<PathBuf, StorageError> {
        let filename = base_name(filename)?;
        let destination = single_component(destination)?;

        let dir = self.root.join(destination);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(filename);
        tokio::fs::write(&path, bytes).await?;

        info!(path = %path.display(), bytes = bytes.len(), "stored assembled file");
        Ok(path)
    }
}

/// Last component of an uploaded name, e.g. `notes.txt` for `../notes.txt`.
fn base_name(name: &str) -> Result<&str, StorageError> {
    Path::new(name)
        .file_name()
        .and_then(|part| part.to_str())
        .ok_or_else(|| StorageError::InvalidName(name.to_string()))
}

/// Accepts only a plain name, so uploads cannot escape their directory.
fn single_component(name: &str) -> Result<&str, StorageError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) => {
            part.to_str().ok_or_else(|| StorageError::InvalidName(name.to_string()))
        }
        _ => Err(StorageError::InvalidName(name.to_string())),
    }
}
