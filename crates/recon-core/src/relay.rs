use std::path::PathBuf;

use async_trait::async_trait;
use recon_model::{NodeId, TaskId};

use crate::error::{CaptureError, RelayError};

/// One captured artifact on its way to another tier.
#[derive(Debug, Clone)]
pub struct Frame {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

/// Uploads a frame to `destination`; returns the remote status code.
///
/// Implementations do not retry.
#[async_trait]
pub trait ImageRelay: Send + Sync + 'static {
    async fn send(&self, destination: &str, frame: Frame) -> Result<u16, RelayError>;
}

/// Produces the artifact for one capture cycle.
#[async_trait]
pub trait Capture: Send + Sync + 'static {
    async fn capture(&self, task: &TaskId, sequence: u32) -> Result<Vec<u8>, CaptureError>;
}

/// Reads the current frame from a file the camera pipeline keeps updated.
#[derive(Debug, Clone)]
pub struct FileCapture {
    path: PathBuf,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Capture for FileCapture {
    async fn capture(&self, _task: &TaskId, _sequence: u32) -> Result<Vec<u8>, CaptureError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| CaptureError::Io {
                path: self.path.clone(),
                source,
            })?;
        if bytes.is_empty() {
            return Err(CaptureError::Empty);
        }
        Ok(bytes)
    }
}
