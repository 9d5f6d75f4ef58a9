//! One process of the recon hierarchy, wired for its tier.
//!
//! Cloud and edge nodes coordinate: they keep a node registry and fan tasks
//! out to it. Workers run the capture loop. Edges and workers both report to
//! an upstream coordinator; the cloud has none.

use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use recon_model::{
    Address, AggregateOutcome, DispatchReport, NodeId, NodeOutcome, NodeRecord, NodeTaskStatus,
    Persisted, StopReport, TaskDescriptor, TaskId, TaskRecord,
};
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::{
    aggregate::Aggregator,
    dispatch::{DispatchConfig, Dispatcher},
    error::CoreError,
    metrics::{self, MetricsHandle},
    peer::{NodeClient, UpstreamNotifier},
    registry::NodeRegistry,
    relay::{Capture, Frame, ImageRelay},
    runner::{Mission, RunnerConfig, TaskRunner},
    spool::ArtifactSpool,
    store::TaskStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cloud,
    Edge,
    Worker,
}

impl Tier {
    pub fn is_coordinator(&self) -> bool {
        matches!(self, Tier::Cloud | Tier::Edge)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Cloud => "cloud",
            Tier::Edge => "edge",
            Tier::Worker => "worker",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cloud" => Ok(Tier::Cloud),
            "edge" => Ok(Tier::Edge),
            "worker" => Ok(Tier::Worker),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub tier: Tier,
    /// Identity used when no upstream assignment applies.
    pub node_id: NodeId,
    /// Coordinator this node reports to and relays images to.
    pub upstream: Option<Address>,
    /// Shared registration secret; empty rejects every registration.
    pub token: String,
    /// Snapshot and spool directory. `None` keeps state in memory and
    /// spools under the system temp dir.
    pub data_dir: Option<PathBuf>,
    /// Nodes registered at start-up (coordinators only).
    pub bootstrap_peers: Vec<Address>,
    pub runner: RunnerConfig,
    pub dispatch: DispatchConfig,
    pub notify_timeout: Duration,
}

impl NodeSettings {
    pub fn new(tier: Tier, node_id: NodeId) -> Self {
        Self {
            tier,
            node_id,
            upstream: None,
            token: String::new(),
            data_dir: None,
            bootstrap_peers: Vec::new(),
            runner: RunnerConfig::default(),
            dispatch: DispatchConfig::default(),
            notify_timeout: Duration::from_secs(10),
        }
    }

    fn spool_root(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.join("spool"),
            None => std::env::temp_dir()
                .join(format!("recon-{}", self.node_id))
                .join("spool"),
        }
    }
}

/// Outbound adapters a node talks through.
#[derive(Clone)]
pub struct NodeDeps {
    pub client: Arc<dyn NodeClient>,
    pub upstream: Arc<dyn UpstreamNotifier>,
    pub relay: Arc<dyn ImageRelay>,
    pub capture: Arc<dyn Capture>,
    pub metrics: MetricsHandle,
}

impl NodeDeps {
    pub fn new(
        client: Arc<dyn NodeClient>,
        upstream: Arc<dyn UpstreamNotifier>,
        relay: Arc<dyn ImageRelay>,
        capture: Arc<dyn Capture>,
    ) -> Self {
        Self {
            client,
            upstream,
            relay,
            capture,
            metrics: metrics::noop(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Result of an init request: coordinators fan out, workers start a loop.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum InitOutcome {
    Dispatched(Persisted<DispatchReport>),
    /// A nested coordinator claimed the task; its fan-out is still running.
    Accepted(Persisted<TaskRecord>),
    Started(Persisted<TaskRecord>),
}

/// Acknowledgement for an uploaded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeReceipt {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub sequence: u32,
    pub path: PathBuf,
    /// An upstream relay was scheduled.
    pub forwarded: bool,
}

pub struct Node {
    settings: NodeSettings,
    registry: NodeRegistry,
    store: TaskStore,
    aggregator: Aggregator,
    dispatcher: Dispatcher,
    runner: TaskRunner,
    relay: Arc<dyn ImageRelay>,
    spool: ArtifactSpool,
    background: TaskTracker,
}

impl Node {
    /// Build the node and restore any persisted state.
    pub async fn open(settings: NodeSettings, deps: NodeDeps) -> Self {
        let (registry, store) = match &settings.data_dir {
            Some(dir) => (
                NodeRegistry::open(settings.token.clone(), dir.join("nodes.json")).await,
                TaskStore::open(dir.join("tasks.json")).await,
            ),
            None => (NodeRegistry::new(settings.token.clone()), TaskStore::new()),
        };

        if settings.tier.is_coordinator() && !settings.bootstrap_peers.is_empty() {
            let seeded = registry.seed(&settings.bootstrap_peers).await;
            if let Some(warning) = seeded.warning {
                warn!(%warning, "bootstrap peers not persisted");
            }
        }

        let aggregator = Aggregator::new(store.clone(), deps.upstream, settings.node_id.clone())
            .with_metrics(Arc::clone(&deps.metrics))
            .with_notify_timeout(settings.notify_timeout);
        let dispatcher = Dispatcher::new(
            registry.clone(),
            store.clone(),
            deps.client,
            aggregator.clone(),
        )
        .with_config(settings.dispatch.clone())
        .with_metrics(Arc::clone(&deps.metrics));
        let runner = TaskRunner::with_metrics(
            settings.runner.clone(),
            deps.capture,
            Arc::clone(&deps.relay),
            aggregator.clone(),
            deps.metrics,
        );
        let spool = ArtifactSpool::new(settings.spool_root());

        info!(
            tier = %settings.tier,
            node = %settings.node_id,
            upstream = settings.upstream.as_deref().unwrap_or("-"),
            nodes = registry.len(),
            tasks = store.len(),
            "node ready"
        );

        Self {
            settings,
            registry,
            store,
            aggregator,
            dispatcher,
            runner,
            relay: deps.relay,
            spool,
            background: TaskTracker::new(),
        }
    }

    pub fn tier(&self) -> Tier {
        self.settings.tier
    }

    pub fn node_id(&self) -> &NodeId {
        &self.settings.node_id
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn spool(&self) -> &ArtifactSpool {
        &self.spool
    }

    /// Start `descriptor` on this node.
    ///
    /// `assigned` is the id the caller knows this node by. Coordinators keep
    /// it for their upstream reports; workers run under it. A coordinator
    /// that has an upstream and was given an id answers once the task is
    /// claimed, so the caller's call timeout never covers our own fan-out.
    #[instrument(level = "info", skip_all, fields(task = %descriptor.id, tier = %self.settings.tier))]
    pub async fn init_task(
        &self,
        descriptor: TaskDescriptor,
        assigned: Option<NodeId>,
        replace: bool,
    ) -> Result<InitOutcome, CoreError> {
        if self.settings.tier.is_coordinator() {
            if assigned.is_some() && self.settings.upstream.is_some() {
                let record = self.dispatcher.accept(descriptor, assigned, replace).await?;
                return Ok(InitOutcome::Accepted(record));
            }
            let report = if replace {
                self.dispatcher.redispatch(descriptor, assigned).await?
            } else {
                self.dispatcher.dispatch(descriptor, assigned).await?
            };
            return Ok(InitOutcome::Dispatched(report));
        }

        let destination = self.settings.upstream.clone().ok_or(CoreError::NoUpstream)?;
        let task_id = descriptor.id.clone();
        let node_id = assigned.unwrap_or_else(|| self.settings.node_id.clone());
        let record = TaskRecord::new(
            descriptor,
            [(node_id.clone(), None)],
            NodeTaskStatus::Running,
        )
        .with_upstream_node(Some(node_id.clone()));

        let mission = Mission {
            task_id: task_id.clone(),
            node_id,
            destination,
        };
        self.runner.start(mission, || {
            if self.store.replace(record.clone()).is_some() {
                debug!(task = %task_id, "previous local run replaced");
            }
        })?;

        let warning = self.store.persist_advisory().await;
        Ok(InitOutcome::Started(Persisted::new(record, warning)))
    }

    /// Stop `task`: fan out on coordinators, end the local loop on workers.
    pub async fn stop_task(&self, task: &TaskId) -> Result<Persisted<StopReport>, CoreError> {
        if self.settings.tier.is_coordinator() {
            return self.dispatcher.stop(task).await;
        }

        let record = self
            .store
            .get(task)
            .ok_or_else(|| CoreError::TaskNotFound(task.clone()))?;
        if let Err(e) = self.runner.stop(task) {
            debug!(%task, error = %e, "no capture loop to cancel");
        }

        let mut nodes = BTreeMap::new();
        let mut status = record.status;
        let mut warning = None;
        for node in record.nodes.keys() {
            let outcome = self.aggregator.report_node_stopped(task, node).await?;
            status = outcome.value.status;
            warning = warning.or(outcome.warning);
            nodes.insert(
                node.to_string(),
                NodeOutcome {
                    node_id: node.clone(),
                    status: outcome.value.node_status,
                    error: None,
                },
            );
        }

        Ok(Persisted::new(
            StopReport {
                task_id: task.clone(),
                status,
                nodes,
            },
            warning,
        ))
    }

    pub fn status(&self, task: &TaskId) -> Result<TaskRecord, CoreError> {
        self.store
            .get(task)
            .ok_or_else(|| CoreError::TaskNotFound(task.clone()))
    }

    pub async fn node_finished(
        &self,
        task: &TaskId,
        node: &NodeId,
    ) -> Result<Persisted<AggregateOutcome>, CoreError> {
        self.aggregator.report_node_finished(task, node).await
    }

    pub async fn node_failed(
        &self,
        task: &TaskId,
        node: &NodeId,
        reason: &str,
    ) -> Result<Persisted<AggregateOutcome>, CoreError> {
        self.aggregator.report_node_failed(task, node, reason).await
    }

    pub async fn register(
        &self,
        token: &str,
        address: &str,
    ) -> Result<Persisted<NodeRecord>, CoreError> {
        self.coordinator_only("registration")?;
        self.registry.register(token, address).await
    }

    pub async fn unregister(
        &self,
        token: &str,
        address: &str,
    ) -> Result<Persisted<NodeRecord>, CoreError> {
        self.coordinator_only("registration")?;
        self.registry.unregister(token, address).await
    }

    pub fn nodes(&self) -> Result<Vec<NodeRecord>, CoreError> {
        self.coordinator_only("node listing")?;
        Ok(self.registry.list())
    }

    /// Spool an image from a lower tier and, if there is an upstream, relay
    /// it in the background. The spooled copy is deleted once relayed.
    pub async fn intake_image(
        &self,
        task: &TaskId,
        node: &NodeId,
        sequence: u32,
        payload: Vec<u8>,
    ) -> Result<IntakeReceipt, CoreError> {
        let path = self.spool.store(task, node, sequence, &payload).await?;

        let forwarded = match &self.settings.upstream {
            Some(destination) => {
                let frame = Frame {
                    task_id: task.clone(),
                    node_id: node.clone(),
                    sequence,
                    payload,
                };
                self.forward(destination.clone(), frame);
                true
            }
            None => false,
        };

        Ok(IntakeReceipt {
            task_id: task.clone(),
            node_id: node.clone(),
            sequence,
            path,
            forwarded,
        })
    }

    /// Relay a spooled image upstream now and delete it on success.
    pub async fn process_upload(
        &self,
        task: &TaskId,
        node: &NodeId,
        sequence: u32,
    ) -> Result<u16, CoreError> {
        let destination = self.settings.upstream.as_deref().ok_or(CoreError::NoUpstream)?;
        let payload = self.spool.load(task, node, sequence).await?;
        let frame = Frame {
            task_id: task.clone(),
            node_id: node.clone(),
            sequence,
            payload,
        };

        let status = self.relay.send(destination, frame).await?;
        self.spool.remove(task, node, sequence).await?;
        info!(%task, %node, sequence, status, "spooled image relayed");
        Ok(status)
    }

    /// Wait for pending fan-outs, stop every capture loop and wait for
    /// pending relays.
    pub async fn shutdown(&self) {
        self.dispatcher.settle().await;
        self.runner.shutdown().await;
        self.background.close();
        self.background.wait().await;
        info!(node = %self.settings.node_id, "node shut down");
    }

    fn forward(&self, destination: Address, frame: Frame) {
        let relay = Arc::clone(&self.relay);
        let spool = self.spool.clone();
        self.background.spawn(async move {
            let (task, node, sequence) = (frame.task_id.clone(), frame.node_id.clone(), frame.sequence);
            match relay.send(&destination, frame).await {
                Ok(status) => {
                    debug!(%task, %node, sequence, status, "image forwarded upstream");
                    if let Err(e) = spool.remove(&task, &node, sequence).await {
                        warn!(%task, %node, sequence, error = %e, "could not clear spooled image");
                    }
                }
                Err(e) => {
                    warn!(%task, %node, sequence, error = %e, "upstream relay failed, image kept");
                }
            }
        });
    }

    fn coordinator_only(&self, what: &'static str) -> Result<(), CoreError> {
        if self.settings.tier.is_coordinator() {
            Ok(())
        } else {
            Err(CoreError::NotCoordinator(what))
        }
    }
}
