pub mod error;
pub use error::{CaptureError, CoreError, PeerError, PersistError, RelayError};

mod snapshot;
pub use snapshot::SnapshotFile;

pub mod metrics;
pub use metrics::{CycleOutcome, MetricsBackend, MetricsHandle, NoopMetrics};

pub mod peer;
pub use peer::{NoUpstream, NodeClient, UpstreamNotifier};

pub mod registry;
pub use registry::NodeRegistry;

pub mod store;
pub use store::TaskStore;

pub mod aggregate;
pub use aggregate::Aggregator;

pub mod dispatch;
pub use dispatch::{DispatchConfig, Dispatcher};

pub mod relay;
pub use relay::{Capture, FileCapture, Frame, ImageRelay};

pub mod runner;
pub use runner::{Mission, RunState, RunnerConfig, TaskRunner};

pub mod spool;
pub use spool::ArtifactSpool;

pub mod node;
pub use node::{InitOutcome, IntakeReceipt, Node, NodeDeps, NodeSettings, Tier};
