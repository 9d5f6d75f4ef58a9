use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::{Address, NodeId, domain::time_serde};

/// A node known to a coordinator's registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: NodeId,
    pub address: Address,
    #[serde(with = "time_serde")]
    pub registered_at: SystemTime,
}
