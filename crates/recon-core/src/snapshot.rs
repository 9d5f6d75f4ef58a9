use std::{marker::PhantomData, path::PathBuf};

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::PersistError;

/// JSON snapshot on disk, rewritten atomically (temp file + rename).
///
/// Writers are serialized and the snapshot value is produced while the write
/// lock is held, so the last completed write always carries the newest state.
pub struct SnapshotFile<T> {
    path: Option<PathBuf>,
    write: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SnapshotFile<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    /// A snapshot that never touches the disk.
    pub fn disabled() -> Self {
        Self {
            path: None,
            write: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    /// Read the snapshot. `Ok(None)` when disabled or the file does not exist.
    pub async fn load(&self) -> Result<Option<T>, PersistError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistError::Io {
                    path: path.clone(),
                    source,
                });
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| PersistError::Format {
                path: path.clone(),
                source,
            })
    }

    /// Write the value produced by `snapshot`.
    pub async fn save_with<F>(&self, snapshot: F) -> Result<(), PersistError>
    where
        F: FnOnce() -> T,
    {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write.lock().await;

        let bytes = serde_json::to_vec_pretty(&snapshot()).map_err(|source| PersistError::Format {
            path: path.clone(),
            source,
        })?;
        let io_err = |source| PersistError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&temp, path).await.map_err(io_err)?;

        trace!(path = %path.display(), bytes = bytes.len(), "snapshot written");
        Ok(())
    }
}
