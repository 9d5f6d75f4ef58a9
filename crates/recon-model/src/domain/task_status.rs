use std::fmt;

use serde::{Deserialize, Serialize};

use crate::NodeTaskStatus;

/// Overall status of a task, derived from its per-node statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    /// At least one node is still active, or no node is known yet.
    Running,
    /// All nodes are terminal, none failed, at least one was stopped.
    Stopped,
    /// Every node finished.
    Finished,
    /// All nodes are terminal and at least one failed.
    Failed,
}

impl TaskStatus {
    /// Collapse per-node statuses into one overall status.
    ///
    /// An empty set is `Running`: a task without nodes must never look finished.
    /// A single failed node does not end the task while siblings are active.
    pub fn aggregate<I>(statuses: I) -> TaskStatus
    where
        I: IntoIterator<Item = NodeTaskStatus>,
    {
        let mut seen = false;
        let mut stopped = false;
        let mut failed = false;

        for status in statuses {
            seen = true;
            match status {
                NodeTaskStatus::Created | NodeTaskStatus::Running => return TaskStatus::Running,
                NodeTaskStatus::Failed => failed = true,
                NodeTaskStatus::Stopped => stopped = true,
                NodeTaskStatus::Finished => {}
            }
        }

        match (seen, failed, stopped) {
            (false, _, _) => TaskStatus::Running,
            (true, true, _) => TaskStatus::Failed,
            (true, false, true) => TaskStatus::Stopped,
            (true, false, false) => TaskStatus::Finished,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NodeTaskStatus::*;

    #[test]
    fn empty_set_is_not_finished() {
        assert_eq!(TaskStatus::aggregate([]), TaskStatus::Running);
    }

    #[test]
    fn any_active_node_keeps_task_running() {
        assert_eq!(TaskStatus::aggregate([Finished, Created]), TaskStatus::Running);
        assert_eq!(TaskStatus::aggregate([Failed, Running]), TaskStatus::Running);
    }

    #[test]
    fn all_finished_is_finished() {
        assert_eq!(
            TaskStatus::aggregate([Finished, Finished, Finished]),
            TaskStatus::Finished
        );
    }

    #[test]
    fn failure_wins_over_stop_once_settled() {
        assert_eq!(TaskStatus::aggregate([Finished, Failed]), TaskStatus::Failed);
        assert_eq!(TaskStatus::aggregate([Stopped, Failed]), TaskStatus::Failed);
        assert_eq!(TaskStatus::aggregate([Stopped, Finished]), TaskStatus::Stopped);
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Finished).unwrap();
        assert_eq!(json, r#""finished""#);
    }
}
