//! Outbound calls to other tiers.
//!
//! The HTTP implementations live in `recon-peer`; tests plug in fakes.

use async_trait::async_trait;
use recon_model::{NodeId, TaskDescriptor, TaskId};
use tracing::debug;

use crate::error::PeerError;

/// Calls a coordinator makes on the nodes it dispatches to.
#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Ask the node at `address` to start `task` as node `node`.
    async fn init_task(
        &self,
        address: &str,
        node: &NodeId,
        task: &TaskDescriptor,
    ) -> Result<(), PeerError>;

    /// Ask the node at `address` to stop `task`.
    async fn stop_task(&self, address: &str, task: &TaskId) -> Result<(), PeerError>;
}

/// Reports a node sends to the tier above it.
#[async_trait]
pub trait UpstreamNotifier: Send + Sync + 'static {
    async fn task_finished(&self, task: &TaskId, node: &NodeId) -> Result<(), PeerError>;

    async fn task_failed(&self, task: &TaskId, node: &NodeId, reason: &str)
    -> Result<(), PeerError>;
}

/// Upstream of the top tier: there is nobody to tell.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUpstream;

#[async_trait]
impl UpstreamNotifier for NoUpstream {
    async fn task_finished(&self, task: &TaskId, node: &NodeId) -> Result<(), PeerError> {
        debug!(%task, %node, "no upstream; finished notification dropped");
        Ok(())
    }

    async fn task_failed(
        &self,
        task: &TaskId,
        node: &NodeId,
        _reason: &str,
    ) -> Result<(), PeerError> {
        debug!(%task, %node, "no upstream; failed notification dropped");
        Ok(())
    }
}
