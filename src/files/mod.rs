use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileStorageError {
    #[error("storage key escapes the storage root: {0}")]
    InvalidKey(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Blob/disk artifacts referenced by session files.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Removing a key that is already gone is not an error.
    async fn remove(&self, key: &str) -> Result<(), FileStorageError>;
}

#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins `key` under the root, refusing anything but plain relative segments.
    pub fn resolve(&self, key: &str) -> Result<PathBuf, FileStorageError> {
        let relative = Path::new(key);
        if key.is_empty() || key.contains('\0') {
            return Err(FileStorageError::InvalidKey(key.to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(FileStorageError::InvalidKey(key.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn remove(&self, key: &str) -> Result<(), FileStorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FileStorageError::Io(format!("{}: {}", path.display(), e))),
        }
    }
}
