use async_trait::async_trait;
use recon_core::{InitOutcome, IntakeReceipt, Tier};
use recon_model::{
    AggregateOutcome, NodeId, NodeRecord, Persisted, StopReport, TaskDescriptor, TaskId,
    TaskRecord,
};
use serde::Serialize;

use crate::error::ApiError;

/// Liveness payload for `GET /`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub service: &'static str,
    pub tier: Tier,
    pub node_id: NodeId,
    pub active_runs: usize,
}

/// Backend behind the HTTP surface.
///
/// [`crate::NodeApiAdapter`] delegates to a [`recon_core::Node`]; other
/// implementations can wrap it with extra policy.
#[async_trait]
pub trait ApiHandler: Send + Sync + 'static {
    fn health(&self) -> Health;

    async fn init_task(
        &self,
        descriptor: TaskDescriptor,
        node: Option<NodeId>,
        replace: bool,
    ) -> Result<InitOutcome, ApiError>;

    async fn task_status(&self, id: &TaskId) -> Result<TaskRecord, ApiError>;

    async fn stop_task(&self, id: &TaskId) -> Result<Persisted<StopReport>, ApiError>;

    async fn node_finished(
        &self,
        task: &TaskId,
        node: &NodeId,
    ) -> Result<Persisted<AggregateOutcome>, ApiError>;

    async fn node_failed(
        &self,
        task: &TaskId,
        node: &NodeId,
        reason: &str,
    ) -> Result<Persisted<AggregateOutcome>, ApiError>;

    /// Relay a spooled image upstream; returns the upstream status code.
    async fn process_upload(&self, task: &TaskId, node: &NodeId, seq: u32) -> Result<u16, ApiError>;

    async fn register(&self, token: &str, address: &str) -> Result<Persisted<NodeRecord>, ApiError>;

    async fn unregister(&self, token: &str, address: &str)
    -> Result<Persisted<NodeRecord>, ApiError>;

    async fn nodes(&self) -> Result<Vec<NodeRecord>, ApiError>;

    async fn intake_image(
        &self,
        task: &TaskId,
        node: &NodeId,
        seq: u32,
        payload: Vec<u8>,
    ) -> Result<IntakeReceipt, ApiError>;
}
