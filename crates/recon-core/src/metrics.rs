//! Metrics hooks for the coordination paths.
//!
//! The core only talks to [`MetricsBackend`]; `recon-prometheus` provides the exporting backend.

use std::sync::Arc;

use recon_model::{NodeTaskStatus, TaskStatus};

/// Result of one capture cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Relayed,
    CaptureFailed,
    RelayFailed,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Relayed => "relayed",
            CycleOutcome::CaptureFailed => "capture_failed",
            CycleOutcome::RelayFailed => "relay_failed",
        }
    }
}

pub trait MetricsBackend: Send + Sync + 'static {
    /// One node's init result during a fan-out.
    fn record_dispatch(&self, outcome: NodeTaskStatus);

    /// A per-node status report that changed a task.
    fn record_node_report(&self, status: NodeTaskStatus);

    /// An upstream notification attempt.
    fn record_upstream_notification(&self, status: TaskStatus, delivered: bool);

    fn record_cycle(&self, outcome: CycleOutcome);
}

pub type MetricsHandle = Arc<dyn MetricsBackend>;

/// Backend that drops every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsBackend for NoopMetrics {
    fn record_dispatch(&self, _outcome: NodeTaskStatus) {}
    fn record_node_report(&self, _status: NodeTaskStatus) {}
    fn record_upstream_notification(&self, _status: TaskStatus, _delivered: bool) {}
    fn record_cycle(&self, _outcome: CycleOutcome) {}
}

pub fn noop() -> MetricsHandle {
    Arc::new(NoopMetrics)
}
