//! On-disk holding area for images received from lower tiers.
//!
//! Layout: `<root>/<task>/<node>_<seq>.jpg`. Writes go through a temp file
//! and a rename so a reader never sees a partial image.

use std::path::PathBuf;

use recon_model::{NodeId, TaskId};
use tracing::debug;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct ArtifactSpool {
    root: PathBuf,
}

impl ArtifactSpool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, task: &TaskId, node: &NodeId, sequence: u32) -> PathBuf {
        self.root
            .join(sanitize(task.as_str()))
            .join(format!("{}_{sequence}.jpg", sanitize(node.as_str())))
    }

    /// Write `payload` and return where it landed.
    pub async fn store(
        &self,
        task: &TaskId,
        node: &NodeId,
        sequence: u32,
        payload: &[u8],
    ) -> Result<PathBuf, CoreError> {
        let path = self.path_for(task, node, sequence);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|source| CoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let tmp = path.with_extension("jpg.tmp");
        tokio::fs::write(&tmp, payload).await.map_err(|source| CoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|source| CoreError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), bytes = payload.len(), "artifact spooled");
        Ok(path)
    }

    pub async fn load(&self, task: &TaskId, node: &NodeId, sequence: u32) -> Result<Vec<u8>, CoreError> {
        let path = self.path_for(task, node, sequence);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::ArtifactNotFound(path.display().to_string()))
            }
            Err(source) => Err(CoreError::Io { path, source }),
        }
    }

    /// Delete a spooled artifact. Missing files are not an error.
    pub async fn remove(&self, task: &TaskId, node: &NodeId, sequence: u32) -> Result<(), CoreError> {
        let path = self.path_for(task, node, sequence);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CoreError::Io { path, source }),
        }
    }
}

/// Map an identifier onto a single safe path component.
fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_paths_flat() {
        assert_eq!(sanitize("task-1"), "task-1");
        assert_eq!(sanitize("a b\\c"), "a_b_c");
        assert_eq!(sanitize(".."), "__");
    }

    #[tokio::test]
    async fn store_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let spool = ArtifactSpool::new(dir.path());
        let (task, node) = (TaskId::from("t1"), NodeId::from("w1"));

        let path = spool.store(&task, &node, 7, b"jpeg").await.unwrap();
        assert_eq!(path, dir.path().join("t1").join("w1_7.jpg"));
        assert_eq!(spool.load(&task, &node, 7).await.unwrap(), b"jpeg");

        spool.remove(&task, &node, 7).await.unwrap();
        assert!(matches!(
            spool.load(&task, &node, 7).await,
            Err(CoreError::ArtifactNotFound(_))
        ));
        spool.remove(&task, &node, 7).await.unwrap();
    }

    #[tokio::test]
    async fn rewrite_replaces_previous_payload() {
        let dir = tempfile::tempdir().unwrap();
        let spool = ArtifactSpool::new(dir.path());
        let (task, node) = (TaskId::from("t1"), NodeId::from("w1"));

        spool.store(&task, &node, 0, b"old").await.unwrap();
        spool.store(&task, &node, 0, b"new").await.unwrap();
        assert_eq!(spool.load(&task, &node, 0).await.unwrap(), b"new");
        assert!(!dir.path().join("t1").join("w1_0.jpg.tmp").exists());
    }
}
