use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use recon_core::{CycleOutcome, MetricsBackend};
use recon_model::{NodeTaskStatus, TaskStatus};

#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    dispatch: IntCounterVec,
    node_reports: IntCounterVec,
    upstream: IntCounterVec,
    cycles: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Register the counters on an existing registry.
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let dispatch = counter(
            &registry,
            "recon_dispatch_total",
            "Per-node init outcomes of task fan-outs",
            &["outcome"],
        )?;
        let node_reports = counter(
            &registry,
            "recon_node_reports_total",
            "Per-node status reports applied to tasks",
            &["status"],
        )?;
        let upstream = counter(
            &registry,
            "recon_upstream_notifications_total",
            "Terminal task reports sent to the upstream coordinator",
            &["kind", "outcome"],
        )?;
        let cycles = counter(
            &registry,
            "recon_capture_cycles_total",
            "Capture loop cycles by result",
            &["outcome"],
        )?;

        Ok(Self {
            registry,
            dispatch,
            node_reports,
            upstream,
            cycles,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Text exposition format, ready for a `/metrics` response.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let c = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl MetricsBackend for PrometheusMetrics {
    fn record_dispatch(&self, outcome: NodeTaskStatus) {
        self.dispatch.with_label_values(&[outcome.as_str()]).inc();
    }

    fn record_node_report(&self, status: NodeTaskStatus) {
        self.node_reports.with_label_values(&[status.as_str()]).inc();
    }

    fn record_upstream_notification(&self, status: TaskStatus, delivered: bool) {
        let outcome = if delivered { "delivered" } else { "failed" };
        self.upstream
            .with_label_values(&[status.as_str(), outcome])
            .inc();
    }

    fn record_cycle(&self, outcome: CycleOutcome) {
        self.cycles.with_label_values(&[outcome.as_str()]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_label() {
        let m = PrometheusMetrics::new().unwrap();
        m.record_dispatch(NodeTaskStatus::Created);
        m.record_dispatch(NodeTaskStatus::Created);
        m.record_dispatch(NodeTaskStatus::Failed);
        m.record_upstream_notification(TaskStatus::Finished, true);
        m.record_cycle(CycleOutcome::RelayFailed);

        assert_eq!(m.dispatch.with_label_values(&["created"]).get(), 2);
        assert_eq!(m.dispatch.with_label_values(&["failed"]).get(), 1);
        assert_eq!(
            m.upstream.with_label_values(&["finished", "delivered"]).get(),
            1
        );

        let text = m.render().unwrap();
        assert!(text.contains("recon_dispatch_total{outcome=\"created\"} 2"));
        assert!(text.contains("recon_capture_cycles_total"));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = Registry::new();
        PrometheusMetrics::with_registry(registry.clone()).unwrap();
        assert!(PrometheusMetrics::with_registry(registry).is_err());
    }
}
