use std::{collections::BTreeMap, time::SystemTime};

use serde::{Deserialize, Serialize};

use crate::{Address, NodeId, NodeTaskStatus, TaskDescriptor, TaskId, TaskStatus, domain::time_serde};

/// One node's share of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    pub status: NodeTaskStatus,
    /// Address the node had when the task was fanned out to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(with = "time_serde")]
    pub updated_at: SystemTime,
    #[serde(
        default,
        with = "time_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub ended_at: Option<SystemTime>,
    /// Last failure cause reported for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeEntry {
    pub fn new(status: NodeTaskStatus, address: Option<Address>, now: SystemTime) -> Self {
        Self {
            status,
            address,
            updated_at: now,
            ended_at: status.is_terminal().then_some(now),
            error: None,
        }
    }
}

/// Full history of one task as kept by a coordinator or a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub priority: String,
    #[serde(with = "time_serde")]
    pub created_at: SystemTime,
    #[serde(
        default,
        with = "time_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub ended_at: Option<SystemTime>,
    pub nodes: BTreeMap<NodeId, NodeEntry>,
    pub status: TaskStatus,
    /// Identifier the upstream tier gave this node for the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_node: Option<NodeId>,
    /// Terminal status already reported upstream, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified: Option<TaskStatus>,
}

/// Result of applying a per-node status report to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The node's status changed.
    Applied,
    /// The transition is not allowed from the current status; nothing changed.
    Ignored,
    /// The node is not part of this task.
    UnknownNode,
}

impl TaskRecord {
    /// Create a record whose nodes all start in `initial`.
    pub fn new<I>(descriptor: TaskDescriptor, nodes: I, initial: NodeTaskStatus) -> Self
    where
        I: IntoIterator<Item = (NodeId, Option<Address>)>,
    {
        let now = time_serde::now();
        let nodes: BTreeMap<_, _> = nodes
            .into_iter()
            .map(|(id, address)| (id, NodeEntry::new(initial, address, now)))
            .collect();
        let status = TaskStatus::aggregate(nodes.values().map(|n| n.status));

        Self {
            id: descriptor.id,
            kind: descriptor.kind,
            name: descriptor.name,
            priority: descriptor.priority,
            created_at: now,
            ended_at: status.is_terminal().then_some(now),
            nodes,
            status,
            upstream_node: None,
            notified: None,
        }
    }

    pub fn with_upstream_node(mut self, node: Option<NodeId>) -> Self {
        self.upstream_node = node;
        self
    }

    pub fn node_status(&self, node: &NodeId) -> Option<NodeTaskStatus> {
        self.nodes.get(node).map(|n| n.status)
    }

    /// Move `node` to `next` if the transition is allowed.
    ///
    /// Does not touch the overall status; call [`TaskRecord::refresh_status`] afterwards.
    pub fn transition(
        &mut self,
        node: &NodeId,
        next: NodeTaskStatus,
        error: Option<String>,
        now: SystemTime,
    ) -> Transition {
        let Some(entry) = self.nodes.get_mut(node) else {
            return Transition::UnknownNode;
        };
        if !entry.status.can_transition_to(next) {
            return Transition::Ignored;
        }

        entry.status = next;
        entry.updated_at = now;
        if next.is_terminal() {
            entry.ended_at = Some(now);
        }
        if error.is_some() {
            entry.error = error;
        }
        Transition::Applied
    }

    /// Recompute the overall status.
    ///
    /// Returns the new status when it changed. `ended_at` is stamped on the
    /// first move into a terminal status.
    pub fn refresh_status(&mut self, now: SystemTime) -> Option<TaskStatus> {
        let next = TaskStatus::aggregate(self.nodes.values().map(|n| n.status));
        if next == self.status {
            return None;
        }
        self.status = next;
        if next.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(now);
        }
        Some(next)
    }

    /// Claim the single upstream notification for the current terminal status.
    ///
    /// Returns the status to report, or `None` when nothing must be sent:
    /// the task is not terminal, the status is `stopped`, or a notification
    /// was already claimed.
    pub fn claim_notification(&mut self) -> Option<TaskStatus> {
        if self.notified.is_some() {
            return None;
        }
        match self.status {
            TaskStatus::Finished | TaskStatus::Failed => {
                self.notified = Some(self.status);
                self.notified
            }
            TaskStatus::Running | TaskStatus::Stopped => None,
        }
    }

    /// Node ids whose status is still active.
    pub fn active_nodes(&self) -> impl Iterator<Item = (&NodeId, &NodeEntry)> {
        self.nodes.iter().filter(|(_, n)| n.status.is_active())
    }
}
