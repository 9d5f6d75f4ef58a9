use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Status of one node's share of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeTaskStatus {
    /// Init was sent (or is being sent) to the node.
    Created,
    /// The node is executing its capture loop.
    Running,
    /// Explicitly cancelled.
    Stopped,
    /// Ran its cycle budget to the end.
    Finished,
    /// Init was not accepted, or the node reported a failure.
    Failed,
}

impl NodeTaskStatus {
    /// Returns `true` for absorbing statuses.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeTaskStatus::Stopped | NodeTaskStatus::Finished | NodeTaskStatus::Failed
        )
    }

    /// Returns `true` while the node may still make progress.
    pub fn is_active(&self) -> bool {
        matches!(self, NodeTaskStatus::Created | NodeTaskStatus::Running)
    }

    /// Whether `self -> next` is an allowed transition.
    ///
    /// Terminal statuses never change; `running` may not fall back to `created`.
    pub fn can_transition_to(&self, next: NodeTaskStatus) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, NodeTaskStatus::Created) => false,
            (NodeTaskStatus::Running, NodeTaskStatus::Running) => false,
            _ => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeTaskStatus::Created => "created",
            NodeTaskStatus::Running => "running",
            NodeTaskStatus::Stopped => "stopped",
            NodeTaskStatus::Finished => "finished",
            NodeTaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeTaskStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(NodeTaskStatus::Created),
            "running" => Ok(NodeTaskStatus::Running),
            "stopped" => Ok(NodeTaskStatus::Stopped),
            "finished" => Ok(NodeTaskStatus::Finished),
            "failed" => Ok(NodeTaskStatus::Failed),
            _ => Err(ModelError::InvalidStatus(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::NodeTaskStatus::*;
    use super::*;

    #[test]
    fn terminal_statuses_are_absorbing() {
        for from in [Stopped, Finished, Failed] {
            for to in [Created, Running, Stopped, Finished, Failed] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn running_moves_only_forward() {
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Finished));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Created));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn created_moves_anywhere_but_back() {
        assert!(Created.can_transition_to(Running));
        assert!(Created.can_transition_to(Finished));
        assert!(Created.can_transition_to(Failed));
        assert!(!Created.can_transition_to(Created));
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("Finished".parse::<NodeTaskStatus>().unwrap(), Finished);
        assert!("done".parse::<NodeTaskStatus>().is_err());
    }
}
