mod ids;
pub use ids::{NodeId, TaskId};

mod node_status;
pub use node_status::NodeTaskStatus;

mod task_status;
pub use task_status::TaskStatus;

mod descriptor;
pub use descriptor::TaskDescriptor;

mod task_record;
pub use task_record::{NodeEntry, TaskRecord, Transition};

mod node_record;
pub use node_record::NodeRecord;

mod report;
pub use report::{AggregateOutcome, DispatchReport, NodeOutcome, StopReport};

mod persisted;
pub use persisted::Persisted;

pub(crate) mod time_serde;
pub use time_serde::now;

/// Network endpoint of a node, e.g. `http://10.0.0.7:8080`.
pub type Address = String;
