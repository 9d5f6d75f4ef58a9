use std::path::PathBuf;

use recon_model::{Address, ModelError, NodeId, TaskId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid registration token")]
    Unauthorized,

    #[error("node already registered: {0}")]
    AlreadyRegistered(Address),

    #[error("node not registered: {0}")]
    NotRegistered(Address),

    #[error("invalid node address: '{0}' (expected http:// or https://)")]
    InvalidAddress(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task already exists: {0}")]
    TaskAlreadyExists(TaskId),

    #[error("task {0} is already running on this node")]
    AlreadyRunning(TaskId),

    #[error("node {node} is not part of task {task}")]
    UnknownNode { task: TaskId, node: NodeId },

    #[error("no nodes available for dispatch")]
    NoNodesAvailable,

    #[error("{0} is only available on cloud and edge nodes")]
    NotCoordinator(&'static str),

    #[error("no upstream configured for this node")]
    NoUpstream,

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("background work interrupted: {0}")]
    Interrupted(String),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("relay failed: {0}")]
    Relay(#[from] RelayError),

    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistError),

    #[error("invalid identifier: {0}")]
    Model(#[from] ModelError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure talking to another node.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("node {address} unreachable: {reason}")]
    Unreachable { address: Address, reason: String },

    #[error("node {address} rejected the request with status {status}")]
    Rejected { address: Address, status: u16 },
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("snapshot io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed snapshot at {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("destination responded with status {status}")]
    Rejected { status: u16 },

    #[error("invalid destination: {0}")]
    Destination(String),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to read capture source {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("capture source is empty")]
    Empty,
}
