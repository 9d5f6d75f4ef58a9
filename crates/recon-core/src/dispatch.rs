use std::{collections::BTreeMap, sync::Arc, time::Duration};

use recon_model::{
    Address, DispatchReport, NodeId, NodeOutcome, NodeRecord, NodeTaskStatus, Persisted,
    StopReport, TaskDescriptor, TaskId, TaskRecord,
};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, instrument, warn};

use crate::{
    aggregate::{Aggregator, Notification},
    error::{CoreError, PeerError},
    metrics::{self, MetricsHandle},
    peer::NodeClient,
    registry::NodeRegistry,
    store::TaskStore,
};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Upper bound for a single init/stop call to one node.
    pub call_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// The id must be new.
    New,
    /// Overwrite whatever history the id has.
    Replace,
}

/// Fans tasks (and their cancellation) out to every registered node.
#[derive(Clone)]
pub struct Dispatcher {
    registry: NodeRegistry,
    store: TaskStore,
    client: Arc<dyn NodeClient>,
    aggregator: Aggregator,
    metrics: MetricsHandle,
    cfg: DispatchConfig,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        registry: NodeRegistry,
        store: TaskStore,
        client: Arc<dyn NodeClient>,
        aggregator: Aggregator,
    ) -> Self {
        Self {
            registry,
            store,
            client,
            aggregator,
            metrics: metrics::noop(),
            cfg: DispatchConfig::default(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_config(mut self, cfg: DispatchConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    /// Create a new task on every registered node.
    ///
    /// Every node is attempted; one node's failure is recorded for that node
    /// only. `upstream_node` is the id the tier above assigned to us, if any.
    /// The fan-out runs on the dispatcher's own task, so dropping the returned
    /// future does not abandon it.
    #[instrument(level = "info", skip_all, fields(task = %descriptor.id))]
    pub async fn dispatch(
        &self,
        descriptor: TaskDescriptor,
        upstream_node: Option<NodeId>,
    ) -> Result<Persisted<DispatchReport>, CoreError> {
        let pending = self.claim(descriptor, upstream_node, Claim::New)?;
        self.tracked(self.clone().fan_out(pending)).await
    }

    /// Dispatch again under an existing id, discarding its per-node history.
    #[instrument(level = "info", skip_all, fields(task = %descriptor.id))]
    pub async fn redispatch(
        &self,
        descriptor: TaskDescriptor,
        upstream_node: Option<NodeId>,
    ) -> Result<Persisted<DispatchReport>, CoreError> {
        let pending = self.claim(descriptor, upstream_node, Claim::Replace)?;
        self.tracked(self.clone().fan_out(pending)).await
    }

    /// Claim the task and return its record before any node is contacted.
    ///
    /// The fan-out continues in the background and settles the record the
    /// same way [`Dispatcher::dispatch`] does.
    #[instrument(level = "info", skip_all, fields(task = %descriptor.id))]
    pub async fn accept(
        &self,
        descriptor: TaskDescriptor,
        upstream_node: Option<NodeId>,
        replace: bool,
    ) -> Result<Persisted<TaskRecord>, CoreError> {
        let claim = if replace { Claim::Replace } else { Claim::New };
        let pending = self.claim(descriptor, upstream_node, claim)?;
        let record = pending.record.clone();

        self.tracker.spawn(self.clone().fan_out(pending).in_current_span());
        let warning = self.store.persist_advisory().await;
        info!(nodes = record.nodes.len(), "task accepted, fan-out in background");
        Ok(Persisted::new(record, warning))
    }

    /// Wait until every fan-out and stop started so far has settled.
    pub async fn settle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    fn claim(
        &self,
        descriptor: TaskDescriptor,
        upstream_node: Option<NodeId>,
        claim: Claim,
    ) -> Result<Pending, CoreError> {
        let nodes = self.registry.list();
        if nodes.is_empty() {
            return Err(CoreError::NoNodesAvailable);
        }

        let record = TaskRecord::new(
            descriptor.clone(),
            nodes
                .iter()
                .map(|n| (n.id.clone(), Some(n.address.clone()))),
            NodeTaskStatus::Created,
        )
        .with_upstream_node(upstream_node);

        match claim {
            Claim::New => self.store.insert_new(record.clone())?,
            Claim::Replace => {
                if let Some(previous) = self.store.replace(record.clone()) {
                    info!(previous = %previous.status, "overwriting task history");
                }
            }
        }

        Ok(Pending {
            descriptor,
            nodes,
            record,
        })
    }

    async fn fan_out(self, pending: Pending) -> Result<Persisted<DispatchReport>, CoreError> {
        let Pending {
            descriptor, nodes, ..
        } = pending;

        let descriptor = Arc::new(descriptor);
        let calls: Vec<_> = nodes
            .into_iter()
            .map(|node| {
                let client = Arc::clone(&self.client);
                let descriptor = Arc::clone(&descriptor);
                let (id, address) = (node.id.clone(), node.address.clone());
                let handle = self.bounded(node.address.clone(), async move {
                    client.init_task(&node.address, &node.id, &descriptor).await
                });
                (id, address, handle)
            })
            .collect();

        let results = collect(calls).await;
        let task_id = descriptor.id.clone();
        let now = recon_model::now();

        let (report, notification) = self.store.update(&task_id, |rec| {
            for (node, address, result) in &results {
                match result {
                    Ok(()) => debug!(%node, %address, "node accepted task"),
                    Err(e) => {
                        warn!(%node, %address, error = %e, "node init failed");
                        rec.transition(node, NodeTaskStatus::Failed, Some(e.to_string()), now);
                    }
                }
            }
            rec.refresh_status(now);

            let outcomes = results
                .iter()
                .map(|(node, address, result)| {
                    let outcome = NodeOutcome {
                        node_id: node.clone(),
                        status: rec.node_status(node).unwrap_or(NodeTaskStatus::Failed),
                        error: result.as_ref().err().map(ToString::to_string),
                    };
                    (address.clone(), outcome)
                })
                .collect::<BTreeMap<_, _>>();

            let report = DispatchReport {
                task_id: task_id.clone(),
                nodes: outcomes,
            };
            (report, Notification::claim(rec))
        })?;

        for outcome in report.nodes.values() {
            self.metrics.record_dispatch(outcome.status);
        }
        info!(
            nodes = report.nodes.len(),
            failed = report.failed(),
            "task dispatched"
        );

        let warning = self.store.persist_advisory().await;
        if let Some(notification) = notification {
            self.aggregator.notify(notification).await;
        }
        Ok(Persisted::new(report, warning))
    }

    /// Ask every still-active node of `task` to stop.
    ///
    /// Nodes that acknowledge are marked `stopped`; the others keep their
    /// status and carry the error in the report.
    #[instrument(level = "info", skip_all, fields(%task))]
    pub async fn stop(&self, task: &TaskId) -> Result<Persisted<StopReport>, CoreError> {
        let this = self.clone();
        let task = task.clone();
        self.tracked(async move { this.stop_now(&task).await }).await
    }

    async fn stop_now(&self, task: &TaskId) -> Result<Persisted<StopReport>, CoreError> {
        let record = self
            .store
            .get(task)
            .ok_or_else(|| CoreError::TaskNotFound(task.clone()))?;

        let mut unresolved = Vec::new();
        let mut calls = Vec::new();
        for (node, entry) in record.active_nodes() {
            let address = entry
                .address
                .clone()
                .or_else(|| self.registry.address_of(node));
            let Some(address) = address else {
                unresolved.push(node.clone());
                continue;
            };

            let client = Arc::clone(&self.client);
            let task = task.clone();
            let target = address.clone();
            let handle = self.bounded(address.clone(), async move {
                client.stop_task(&target, &task).await
            });
            calls.push((node.clone(), address, handle));
        }

        let results = collect(calls).await;
        let now = recon_model::now();

        let (report, notification) = self.store.update(task, |rec| {
            let mut nodes = BTreeMap::new();
            for (node, address, result) in &results {
                if result.is_ok() {
                    rec.transition(node, NodeTaskStatus::Stopped, None, now);
                }
                nodes.insert(
                    address.clone(),
                    NodeOutcome {
                        node_id: node.clone(),
                        status: rec.node_status(node).unwrap_or(NodeTaskStatus::Stopped),
                        error: result.as_ref().err().map(ToString::to_string),
                    },
                );
            }
            for node in &unresolved {
                nodes.insert(
                    format!("unknown:{node}"),
                    NodeOutcome {
                        node_id: node.clone(),
                        status: rec.node_status(node).unwrap_or(NodeTaskStatus::Created),
                        error: Some("no known address for node".to_string()),
                    },
                );
            }
            rec.refresh_status(now);

            let report = StopReport {
                task_id: task.clone(),
                status: rec.status,
                nodes,
            };
            (report, Notification::claim(rec))
        })?;

        info!(status = %report.status, nodes = report.nodes.len(), "stop fanned out");
        let warning = self.store.persist_advisory().await;
        if let Some(notification) = notification {
            self.aggregator.notify(notification).await;
        }
        Ok(Persisted::new(report, warning))
    }

    /// Run `work` on the tracker and wait for it; the caller going away
    /// leaves it running.
    async fn tracked<T, F>(&self, work: F) -> Result<T, CoreError>
    where
        F: Future<Output = Result<T, CoreError>> + Send + 'static,
        T: Send + 'static,
    {
        self.tracker
            .spawn(work.in_current_span())
            .await
            .map_err(|e| CoreError::Interrupted(e.to_string()))?
    }

    /// Spawn a peer call bounded by the configured timeout.
    fn bounded<F>(&self, address: Address, call: F) -> JoinHandle<Result<(), PeerError>>
    where
        F: Future<Output = Result<(), PeerError>> + Send + 'static,
    {
        let timeout = self.cfg.call_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(PeerError::Unreachable {
                    address,
                    reason: format!("timed out after {}ms", timeout.as_millis()),
                }),
            }
        })
    }
}

/// A claimed record whose nodes have not been contacted yet.
struct Pending {
    descriptor: TaskDescriptor,
    nodes: Vec<NodeRecord>,
    record: TaskRecord,
}

type PeerCall = (NodeId, Address, JoinHandle<Result<(), PeerError>>);

/// Await spawned calls; they already run concurrently.
async fn collect(calls: Vec<PeerCall>) -> Vec<(NodeId, Address, Result<(), PeerError>)> {
    let mut results = Vec::with_capacity(calls.len());
    for (node, address, handle) in calls {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(PeerError::Unreachable {
                address: address.clone(),
                reason: format!("call aborted: {e}"),
            }),
        };
        results.push((node, address, result));
    }
    results
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use async_trait::async_trait;
    use recon_model::TaskStatus;

    use super::*;
    use crate::peer::UpstreamNotifier;

    const TOKEN: &str = "t0ken";

    #[derive(Clone, Copy)]
    enum Behaviour {
        Accept,
        Unreachable,
        Reject(u16),
        Hang,
    }

    #[derive(Default)]
    struct FakeNodes {
        behaviour: HashMap<String, Behaviour>,
        init_calls: Mutex<Vec<(String, NodeId)>>,
        stop_calls: Mutex<Vec<String>>,
    }

    impl FakeNodes {
        fn with(pairs: &[(&str, Behaviour)]) -> Self {
            Self {
                behaviour: pairs.iter().map(|(a, b)| (a.to_string(), *b)).collect(),
                ..Default::default()
            }
        }

        async fn act(&self, address: &str) -> Result<(), PeerError> {
            match self.behaviour.get(address).copied().unwrap_or(Behaviour::Accept) {
                Behaviour::Accept => Ok(()),
                Behaviour::Unreachable => Err(PeerError::Unreachable {
                    address: address.to_string(),
                    reason: "connection refused".into(),
                }),
                Behaviour::Reject(status) => Err(PeerError::Rejected {
                    address: address.to_string(),
                    status,
                }),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    #[async_trait]
    impl NodeClient for FakeNodes {
        async fn init_task(
            &self,
            address: &str,
            node: &NodeId,
            _task: &TaskDescriptor,
        ) -> Result<(), PeerError> {
            self.init_calls
                .lock()
                .unwrap()
                .push((address.to_string(), node.clone()));
            self.act(address).await
        }

        async fn stop_task(&self, address: &str, _task: &TaskId) -> Result<(), PeerError> {
            self.stop_calls.lock().unwrap().push(address.to_string());
            self.act(address).await
        }
    }

    #[derive(Default)]
    struct CountingUpstream {
        finished: Mutex<u32>,
        failed: Mutex<u32>,
    }

    #[async_trait]
    impl UpstreamNotifier for CountingUpstream {
        async fn task_finished(&self, _: &TaskId, _: &NodeId) -> Result<(), PeerError> {
            *self.finished.lock().unwrap() += 1;
            Ok(())
        }

        async fn task_failed(&self, _: &TaskId, _: &NodeId, _: &str) -> Result<(), PeerError> {
            *self.failed.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        store: TaskStore,
        nodes: Arc<FakeNodes>,
        upstream: Arc<CountingUpstream>,
    }

    async fn fixture(addresses: &[&str], fake: FakeNodes) -> Fixture {
        fixture_with_store(addresses, fake, TaskStore::new()).await
    }

    async fn fixture_with_store(addresses: &[&str], fake: FakeNodes, store: TaskStore) -> Fixture {
        let registry = NodeRegistry::new(TOKEN);
        for a in addresses {
            registry.register(TOKEN, a).await.unwrap();
        }
        let nodes = Arc::new(fake);
        let upstream = Arc::new(CountingUpstream::default());
        let aggregator = Aggregator::new(store.clone(), upstream.clone(), NodeId::from("edge"));
        let dispatcher = Dispatcher::new(registry, store.clone(), nodes.clone(), aggregator)
            .with_config(DispatchConfig {
                call_timeout: Duration::from_millis(500),
            });
        Fixture {
            dispatcher,
            store,
            nodes,
            upstream,
        }
    }

    fn task(id: &str) -> TaskDescriptor {
        TaskDescriptor::new(TaskId::from(id), "edge", "reconnaissance", "high")
    }

    #[tokio::test]
    async fn partial_failure_is_recorded_per_node() {
        let fx = fixture(
            &["http://n1", "http://n2", "http://n3"],
            FakeNodes::with(&[("http://n2", Behaviour::Unreachable)]),
        )
        .await;

        let report = fx.dispatcher.dispatch(task("T1"), None).await.unwrap().value;

        assert_eq!(report.nodes.len(), 3);
        assert_eq!(report.nodes["http://n1"].status, NodeTaskStatus::Created);
        assert_eq!(report.nodes["http://n2"].status, NodeTaskStatus::Failed);
        assert!(report.nodes["http://n2"].error.as_deref().unwrap().contains("unreachable"));
        assert_eq!(report.nodes["http://n3"].status, NodeTaskStatus::Created);
        assert_eq!(report.failed(), 1);

        let rec = fx.store.get(&TaskId::from("T1")).unwrap();
        assert_eq!(rec.nodes.len(), 3);
        assert_eq!(rec.status, TaskStatus::Running);
        assert_eq!(fx.nodes.init_calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rejected_init_is_a_node_failure() {
        let fx = fixture(
            &["http://n1", "http://n2"],
            FakeNodes::with(&[("http://n1", Behaviour::Reject(500))]),
        )
        .await;

        let report = fx.dispatcher.dispatch(task("T1"), None).await.unwrap().value;
        assert_eq!(report.nodes["http://n1"].status, NodeTaskStatus::Failed);
        assert!(report.nodes["http://n1"].error.as_deref().unwrap().contains("500"));
        assert_eq!(report.nodes["http://n2"].status, NodeTaskStatus::Created);
    }

    #[tokio::test]
    async fn empty_registry_fails_fast() {
        let fx = fixture(&[], FakeNodes::default()).await;
        let res = fx.dispatcher.dispatch(task("T1"), None).await;
        assert!(matches!(res, Err(CoreError::NoNodesAvailable)));
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn known_id_needs_explicit_redispatch() {
        let fx = fixture(
            &["http://n1"],
            FakeNodes::with(&[("http://n1", Behaviour::Unreachable)]),
        )
        .await;
        fx.dispatcher.dispatch(task("T1"), None).await.unwrap();

        let res = fx.dispatcher.dispatch(task("T1"), None).await;
        assert!(matches!(res, Err(CoreError::TaskAlreadyExists(_))));
        assert_eq!(fx.nodes.init_calls.lock().unwrap().len(), 1);

        let again = fx.dispatcher.redispatch(task("T1"), None).await.unwrap().value;
        assert_eq!(again.nodes.len(), 1);
        assert_eq!(fx.nodes.init_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_node_times_out_without_blocking_others() {
        let fx = fixture(
            &["http://n1", "http://slow"],
            FakeNodes::with(&[("http://slow", Behaviour::Hang)]),
        )
        .await;

        let report = fx.dispatcher.dispatch(task("T1"), None).await.unwrap().value;
        assert_eq!(report.nodes["http://n1"].status, NodeTaskStatus::Created);
        assert_eq!(report.nodes["http://slow"].status, NodeTaskStatus::Failed);
        assert!(report.nodes["http://slow"].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_dispatch_still_settles_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let fx = fixture_with_store(
            &["http://n1", "http://slow"],
            FakeNodes::with(&[("http://slow", Behaviour::Hang)]),
            TaskStore::open(path.clone()).await,
        )
        .await;

        let gave_up = tokio::time::timeout(
            Duration::from_millis(100),
            fx.dispatcher.dispatch(task("T1"), None),
        )
        .await;
        assert!(gave_up.is_err());

        fx.dispatcher.settle().await;

        let restored = TaskStore::open(path).await;
        let rec = restored.get(&TaskId::from("T1")).unwrap();
        let status_of = |address: &str| {
            rec.nodes
                .values()
                .find(|n| n.address.as_deref() == Some(address))
                .map(|n| n.status)
        };
        assert_eq!(status_of("http://n1"), Some(NodeTaskStatus::Created));
        assert_eq!(status_of("http://slow"), Some(NodeTaskStatus::Failed));
        assert_eq!(rec.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn accept_returns_claimed_record_before_nodes_answer() {
        let fx = fixture(
            &["http://n1", "http://n2"],
            FakeNodes::with(&[("http://n2", Behaviour::Unreachable)]),
        )
        .await;

        let record = fx
            .dispatcher
            .accept(task("T1"), Some(NodeId::from("edge-1")), false)
            .await
            .unwrap()
            .value;
        assert_eq!(record.nodes.len(), 2);
        assert!(record.nodes.values().all(|n| n.status == NodeTaskStatus::Created));

        assert!(matches!(
            fx.dispatcher.accept(task("T1"), None, false).await,
            Err(CoreError::TaskAlreadyExists(_))
        ));

        fx.dispatcher.settle().await;
        let rec = fx.store.get(&TaskId::from("T1")).unwrap();
        assert_eq!(rec.upstream_node, Some(NodeId::from("edge-1")));
        assert_eq!(rec.nodes.values().filter(|n| n.status == NodeTaskStatus::Failed).count(), 1);
        assert_eq!(fx.nodes.init_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn total_failure_is_reported_upstream_once() {
        let fx = fixture(
            &["http://n1", "http://n2"],
            FakeNodes::with(&[
                ("http://n1", Behaviour::Unreachable),
                ("http://n2", Behaviour::Unreachable),
            ]),
        )
        .await;

        fx.dispatcher
            .dispatch(task("T1"), Some(NodeId::from("edge-1")))
            .await
            .unwrap();
        let rec = fx.store.get(&TaskId::from("T1")).unwrap();
        assert_eq!(rec.status, TaskStatus::Failed);
        assert_eq!(*fx.upstream.failed.lock().unwrap(), 1);
        assert_eq!(*fx.upstream.finished.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn stop_marks_acknowledged_nodes() {
        let fx = fixture(&["http://n1", "http://n2"], FakeNodes::default()).await;
        fx.dispatcher.dispatch(task("T1"), None).await.unwrap();

        // n2 goes away between dispatch and stop.
        let fx = Fixture {
            dispatcher: Dispatcher {
                client: Arc::new(FakeNodes::with(&[("http://n2", Behaviour::Unreachable)])),
                ..fx.dispatcher.clone()
            },
            ..fx
        };

        let report = fx.dispatcher.stop(&TaskId::from("T1")).await.unwrap().value;
        assert_eq!(report.nodes["http://n1"].status, NodeTaskStatus::Stopped);
        assert_eq!(report.nodes["http://n2"].status, NodeTaskStatus::Created);
        assert!(report.nodes["http://n2"].error.is_some());
        assert_eq!(report.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn stop_all_nodes_settles_task_as_stopped() {
        let fx = fixture(&["http://n1", "http://n2"], FakeNodes::default()).await;
        fx.dispatcher.dispatch(task("T1"), None).await.unwrap();

        let report = fx.dispatcher.stop(&TaskId::from("T1")).await.unwrap().value;
        assert_eq!(report.status, TaskStatus::Stopped);
        assert_eq!(fx.nodes.stop_calls.lock().unwrap().len(), 2);

        // Already stopped nodes are not contacted again.
        fx.dispatcher.stop(&TaskId::from("T1")).await.unwrap();
        assert_eq!(fx.nodes.stop_calls.lock().unwrap().len(), 2);
        assert_eq!(*fx.upstream.finished.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn stop_unknown_task_is_not_found() {
        let fx = fixture(&["http://n1"], FakeNodes::default()).await;
        let res = fx.dispatcher.stop(&TaskId::from("ghost")).await;
        assert!(matches!(res, Err(CoreError::TaskNotFound(_))));
    }
}
