use async_trait::async_trait;
use recon_core::{PeerError, UpstreamNotifier};
use recon_model::{Address, NodeId, TaskId};
use tracing::info;

use crate::client::HttpPeer;

/// Reports task outcomes to the coordinator one tier up.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    peer: HttpPeer,
    address: Address,
}

impl HttpUpstream {
    pub fn new(peer: HttpPeer, address: impl Into<Address>) -> Self {
        Self {
            peer,
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl UpstreamNotifier for HttpUpstream {
    async fn task_finished(&self, task: &TaskId, node: &NodeId) -> Result<(), PeerError> {
        self.peer
            .get(
                &self.address,
                &["task", "finish", task.as_str(), node.as_str()],
                &[],
            )
            .await?;
        info!(%task, %node, upstream = %self.address, "reported finished");
        Ok(())
    }

    async fn task_failed(&self, task: &TaskId, node: &NodeId, reason: &str) -> Result<(), PeerError> {
        self.peer
            .get(
                &self.address,
                &["task", "fail", task.as_str(), node.as_str()],
                &[("reason", reason)],
            )
            .await?;
        info!(%task, %node, upstream = %self.address, "reported failed");
        Ok(())
    }
}
