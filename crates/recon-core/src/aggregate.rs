use std::{sync::Arc, time::Duration};

use recon_model::{
    AggregateOutcome, NodeId, NodeTaskStatus, Persisted, TaskId, TaskRecord, TaskStatus, Transition,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{CoreError, PeerError},
    metrics::{self, MetricsHandle},
    peer::UpstreamNotifier,
    store::TaskStore,
};

const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// A terminal status that must be reported upstream, claimed under the store lock.
#[derive(Debug, Clone)]
pub(crate) struct Notification {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub upstream_node: Option<NodeId>,
    pub reason: Option<String>,
}

impl Notification {
    /// Claim the record's notification, if one is due.
    pub(crate) fn claim(record: &mut TaskRecord) -> Option<Self> {
        let status = record.claim_notification()?;
        let reason = record
            .nodes
            .values()
            .filter(|n| n.status == NodeTaskStatus::Failed)
            .find_map(|n| n.error.clone());

        Some(Self {
            task_id: record.id.clone(),
            status,
            upstream_node: record.upstream_node.clone(),
            reason,
        })
    }
}

/// Merges per-node reports into task records and notifies the tier above.
#[derive(Clone)]
pub struct Aggregator {
    store: TaskStore,
    upstream: Arc<dyn UpstreamNotifier>,
    metrics: MetricsHandle,
    /// Identity used upstream when a record carries no upstream node id.
    self_node: NodeId,
    notify_timeout: Duration,
}

impl Aggregator {
    pub fn new(store: TaskStore, upstream: Arc<dyn UpstreamNotifier>, self_node: NodeId) -> Self {
        Self {
            store,
            upstream,
            metrics: metrics::noop(),
            self_node,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub async fn report_node_finished(
        &self,
        task: &TaskId,
        node: &NodeId,
    ) -> Result<Persisted<AggregateOutcome>, CoreError> {
        self.report(task, node, NodeTaskStatus::Finished, None).await
    }

    pub async fn report_node_failed(
        &self,
        task: &TaskId,
        node: &NodeId,
        reason: impl Into<String>,
    ) -> Result<Persisted<AggregateOutcome>, CoreError> {
        self.report(task, node, NodeTaskStatus::Failed, Some(reason.into()))
            .await
    }

    pub async fn report_node_stopped(
        &self,
        task: &TaskId,
        node: &NodeId,
    ) -> Result<Persisted<AggregateOutcome>, CoreError> {
        self.report(task, node, NodeTaskStatus::Stopped, None).await
    }

    pub async fn report_node_running(
        &self,
        task: &TaskId,
        node: &NodeId,
    ) -> Result<Persisted<AggregateOutcome>, CoreError> {
        self.report(task, node, NodeTaskStatus::Running, None).await
    }

    #[instrument(level = "debug", skip_all, fields(%task, %node, %status))]
    async fn report(
        &self,
        task: &TaskId,
        node: &NodeId,
        status: NodeTaskStatus,
        error: Option<String>,
    ) -> Result<Persisted<AggregateOutcome>, CoreError> {
        let now = recon_model::now();

        let (mut outcome, notification) = self.store.update(task, |rec| {
            let changed = match rec.transition(node, status, error, now) {
                Transition::UnknownNode => {
                    return Err(CoreError::UnknownNode {
                        task: task.clone(),
                        node: node.clone(),
                    });
                }
                Transition::Ignored => false,
                Transition::Applied => {
                    rec.refresh_status(now);
                    true
                }
            };
            let notification = Notification::claim(rec);
            let outcome = AggregateOutcome {
                task_id: task.clone(),
                node_id: node.clone(),
                node_status: rec.node_status(node).unwrap_or(status),
                status: rec.status,
                changed,
                notified: None,
            };
            Ok((outcome, notification))
        })??;

        if outcome.changed {
            self.metrics.record_node_report(status);
            debug!(overall = %outcome.status, "node report applied");
        } else {
            debug!(
                current = %outcome.node_status,
                "duplicate or late node report ignored"
            );
        }

        // Persist before notifying so the claim survives a restart.
        let warning = if outcome.changed || notification.is_some() {
            self.store.persist_advisory().await
        } else {
            None
        };

        if let Some(notification) = notification {
            outcome.notified = Some(notification.status);
            self.notify(notification).await;
        }

        Ok(Persisted::new(outcome, warning))
    }

    /// Send one claimed notification upstream.
    ///
    /// Failures are logged and counted; the claim is not released.
    pub(crate) async fn notify(&self, n: Notification) -> bool {
        let node = n.upstream_node.as_ref().unwrap_or(&self.self_node);
        let call = async {
            match n.status {
                TaskStatus::Failed => {
                    let reason = n.reason.as_deref().unwrap_or("node failure");
                    self.upstream.task_failed(&n.task_id, node, reason).await
                }
                _ => self.upstream.task_finished(&n.task_id, node).await,
            }
        };

        let result = match tokio::time::timeout(self.notify_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PeerError::Unreachable {
                address: "upstream".to_string(),
                reason: format!("timed out after {}ms", self.notify_timeout.as_millis()),
            }),
        };

        let delivered = result.is_ok();
        self.metrics
            .record_upstream_notification(n.status, delivered);
        match result {
            Ok(()) => info!(task = %n.task_id, %node, status = %n.status, "upstream notified"),
            Err(e) => warn!(
                task = %n.task_id,
                %node,
                status = %n.status,
                error = %e,
                "upstream notification failed"
            ),
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use recon_model::TaskDescriptor;

    use super::*;

    #[derive(Default)]
    struct RecordingUpstream {
        calls: Mutex<Vec<(String, TaskId, NodeId)>>,
    }

    impl RecordingUpstream {
        fn calls(&self) -> Vec<(String, TaskId, NodeId)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamNotifier for RecordingUpstream {
        async fn task_finished(&self, task: &TaskId, node: &NodeId) -> Result<(), PeerError> {
            self.calls
                .lock()
                .unwrap()
                .push(("finished".into(), task.clone(), node.clone()));
            Ok(())
        }

        async fn task_failed(
            &self,
            task: &TaskId,
            node: &NodeId,
            reason: &str,
        ) -> Result<(), PeerError> {
            self.calls
                .lock()
                .unwrap()
                .push((format!("failed:{reason}"), task.clone(), node.clone()));
            Ok(())
        }
    }

    fn setup(nodes: &[&str]) -> (Aggregator, Arc<RecordingUpstream>, TaskId) {
        let store = TaskStore::new();
        let id = TaskId::from("t1");
        store
            .insert_new(
                TaskRecord::new(
                    TaskDescriptor::new(id.clone(), "edge", "reconnaissance", "1"),
                    nodes.iter().map(|n| (NodeId::from(*n), None)),
                    NodeTaskStatus::Created,
                )
                .with_upstream_node(Some(NodeId::from("edge-7"))),
            )
            .unwrap();
        let upstream = Arc::new(RecordingUpstream::default());
        let agg = Aggregator::new(store, upstream.clone(), NodeId::from("self"));
        (agg, upstream, id)
    }

    #[tokio::test]
    async fn finishes_only_when_all_nodes_finish() {
        let (agg, upstream, id) = setup(&["a", "b"]);

        let out = agg.report_node_finished(&id, &NodeId::from("a")).await.unwrap().value;
        assert_eq!(out.status, TaskStatus::Running);
        assert!(out.notified.is_none());
        assert!(upstream.calls().is_empty());

        let out = agg.report_node_finished(&id, &NodeId::from("b")).await.unwrap().value;
        assert_eq!(out.status, TaskStatus::Finished);
        assert_eq!(out.notified, Some(TaskStatus::Finished));

        let rec = agg.store().get(&id).unwrap();
        assert!(rec.nodes.values().all(|n| n.status == NodeTaskStatus::Finished));
        assert!(rec.ended_at.is_some());
        assert_eq!(
            upstream.calls(),
            vec![("finished".to_string(), id.clone(), NodeId::from("edge-7"))]
        );
    }

    #[tokio::test]
    async fn running_report_moves_created_node_forward_only() {
        let (agg, upstream, id) = setup(&["a"]);
        let a = NodeId::from("a");

        let out = agg.report_node_running(&id, &a).await.unwrap().value;
        assert!(out.changed);
        assert_eq!(out.node_status, NodeTaskStatus::Running);
        assert_eq!(out.status, TaskStatus::Running);

        agg.report_node_finished(&id, &a).await.unwrap();
        let late = agg.report_node_running(&id, &a).await.unwrap().value;
        assert!(!late.changed);
        assert_eq!(late.node_status, NodeTaskStatus::Finished);
        assert_eq!(upstream.calls().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_finish_notifies_exactly_once() {
        let (agg, upstream, id) = setup(&["a"]);

        let first = agg.report_node_finished(&id, &NodeId::from("a")).await.unwrap().value;
        let second = agg.report_node_finished(&id, &NodeId::from("a")).await.unwrap().value;

        assert!(first.changed);
        assert!(!second.changed);
        assert!(second.notified.is_none());
        assert_eq!(second.status, TaskStatus::Finished);
        assert_eq!(upstream.calls().len(), 1);
    }

    #[tokio::test]
    async fn single_failure_waits_for_siblings() {
        let (agg, upstream, id) = setup(&["a", "b"]);

        let out = agg
            .report_node_failed(&id, &NodeId::from("a"), "camera offline")
            .await
            .unwrap()
            .value;
        assert_eq!(out.status, TaskStatus::Running);
        assert!(upstream.calls().is_empty());

        let out = agg.report_node_finished(&id, &NodeId::from("b")).await.unwrap().value;
        assert_eq!(out.status, TaskStatus::Failed);
        assert_eq!(
            upstream.calls(),
            vec![("failed:camera offline".to_string(), id.clone(), NodeId::from("edge-7"))]
        );
    }

    #[tokio::test]
    async fn stopped_task_is_not_reported() {
        let (agg, upstream, id) = setup(&["a"]);
        let out = agg.report_node_stopped(&id, &NodeId::from("a")).await.unwrap().value;
        assert_eq!(out.status, TaskStatus::Stopped);
        assert!(upstream.calls().is_empty());

        // A late finish after the stop is ignored.
        let out = agg.report_node_finished(&id, &NodeId::from("a")).await.unwrap().value;
        assert!(!out.changed);
        assert_eq!(out.node_status, NodeTaskStatus::Stopped);
    }

    #[tokio::test]
    async fn unknown_task_and_node_are_rejected() {
        let (agg, _, id) = setup(&["a"]);

        let res = agg.report_node_finished(&TaskId::from("nope"), &NodeId::from("a")).await;
        assert!(matches!(res, Err(CoreError::TaskNotFound(_))));

        let res = agg.report_node_finished(&id, &NodeId::from("zz")).await;
        assert!(matches!(res, Err(CoreError::UnknownNode { .. })));
    }

    #[tokio::test]
    async fn concurrent_duplicate_reports_notify_once() {
        let (agg, upstream, id) = setup(&["a", "b"]);
        agg.report_node_finished(&id, &NodeId::from("a")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let agg = agg.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                agg.report_node_finished(&id, &NodeId::from("b")).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(upstream.calls().len(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_own_node_id() {
        let store = TaskStore::new();
        let id = TaskId::from("t9");
        store
            .insert_new(TaskRecord::new(
                TaskDescriptor::new(id.clone(), "edge", "track", "1"),
                [(NodeId::from("a"), None)],
                NodeTaskStatus::Running,
            ))
            .unwrap();
        let upstream = Arc::new(RecordingUpstream::default());
        let agg = Aggregator::new(store, upstream.clone(), NodeId::from("self"));

        agg.report_node_finished(&id, &NodeId::from("a")).await.unwrap();
        assert_eq!(upstream.calls()[0].2, NodeId::from("self"));
    }
}
