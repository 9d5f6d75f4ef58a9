use serde::{Deserialize, Serialize};

use crate::TaskId;

/// What a creator asks for when it creates a task.
///
/// `kind`, `name` and `priority` are opaque to the coordination logic; they
/// are stored and forwarded to nodes unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub priority: String,
}

impl TaskDescriptor {
    pub fn new(
        id: TaskId,
        kind: impl Into<String>,
        name: impl Into<String>,
        priority: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind: kind.into(),
            name: name.into(),
            priority: priority.into(),
        }
    }
}
