use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Address, NodeId, NodeTaskStatus, TaskId, TaskStatus};

/// Outcome of one node's init or stop call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutcome {
    pub node_id: NodeId,
    pub status: NodeTaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-node result of a fan-out, keyed by node address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub task_id: TaskId,
    pub nodes: BTreeMap<Address, NodeOutcome>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.nodes
            .values()
            .filter(|o| o.status != NodeTaskStatus::Failed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.nodes.len() - self.succeeded()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Per-node result of a stop fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub nodes: BTreeMap<Address, NodeOutcome>,
}

/// What a per-node status report did to its task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateOutcome {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub node_status: NodeTaskStatus,
    pub status: TaskStatus,
    /// `false` when the report was a duplicate or arrived too late.
    pub changed: bool,
    /// Terminal status sent upstream because of this report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified: Option<TaskStatus>,
}
