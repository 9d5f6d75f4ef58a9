use std::sync::Arc;

use async_trait::async_trait;
use recon_core::{InitOutcome, IntakeReceipt, Node};
use recon_model::{
    AggregateOutcome, NodeId, NodeRecord, Persisted, StopReport, TaskDescriptor, TaskId,
    TaskRecord,
};

use crate::error::ApiError;
use crate::handler::{ApiHandler, Health};

/// Delegates every call to a [`Node`].
pub struct NodeApiAdapter {
    node: Arc<Node>,
}

impl NodeApiAdapter {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl ApiHandler for NodeApiAdapter {
    fn health(&self) -> Health {
        Health {
            service: "recon-agentd",
            tier: self.node.tier(),
            node_id: self.node.node_id().clone(),
            active_runs: self.node.runner().active(),
        }
    }

    async fn init_task(
        &self,
        descriptor: TaskDescriptor,
        node: Option<NodeId>,
        replace: bool,
    ) -> Result<InitOutcome, ApiError> {
        Ok(self.node.init_task(descriptor, node, replace).await?)
    }

    async fn task_status(&self, id: &TaskId) -> Result<TaskRecord, ApiError> {
        Ok(self.node.status(id)?)
    }

    async fn stop_task(&self, id: &TaskId) -> Result<Persisted<StopReport>, ApiError> {
        Ok(self.node.stop_task(id).await?)
    }

    async fn node_finished(
        &self,
        task: &TaskId,
        node: &NodeId,
    ) -> Result<Persisted<AggregateOutcome>, ApiError> {
        Ok(self.node.node_finished(task, node).await?)
    }

    async fn node_failed(
        &self,
        task: &TaskId,
        node: &NodeId,
        reason: &str,
    ) -> Result<Persisted<AggregateOutcome>, ApiError> {
        Ok(self.node.node_failed(task, node, reason).await?)
    }

    async fn process_upload(&self, task: &TaskId, node: &NodeId, seq: u32) -> Result<u16, ApiError> {
        Ok(self.node.process_upload(task, node, seq).await?)
    }

    async fn register(&self, token: &str, address: &str) -> Result<Persisted<NodeRecord>, ApiError> {
        Ok(self.node.register(token, address).await?)
    }

    async fn unregister(
        &self,
        token: &str,
        address: &str,
    ) -> Result<Persisted<NodeRecord>, ApiError> {
        Ok(self.node.unregister(token, address).await?)
    }

    async fn nodes(&self) -> Result<Vec<NodeRecord>, ApiError> {
        Ok(self.node.nodes()?)
    }

    async fn intake_image(
        &self,
        task: &TaskId,
        node: &NodeId,
        seq: u32,
        payload: Vec<u8>,
    ) -> Result<IntakeReceipt, ApiError> {
        Ok(self.node.intake_image(task, node, seq, payload).await?)
    }
}
