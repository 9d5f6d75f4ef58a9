//! Per-task capture loop run by worker nodes.
//!
//! Cancellation is cooperative: [`TaskRunner::stop`] only sets a token, and the
//! loop polls it once per cycle, right after the interval wait. A stop is
//! therefore observed at most one interval later, and no capture starts after
//! the poll that observed it. The cycle budget bounds every loop.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use recon_model::{Address, NodeId, TaskId};
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    aggregate::Aggregator,
    error::CoreError,
    metrics::{self, CycleOutcome, MetricsHandle},
    relay::{Capture, Frame, ImageRelay},
};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Capture cycles per mission.
    pub cycles: u32,
    /// Wait before each capture.
    pub interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cycles: 360,
            interval: Duration::from_secs(10),
        }
    }
}

/// Lifecycle of one capture loop. `cycles` counts completed cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum RunState {
    Idle,
    Running { cycles: u32 },
    Stopped { cycles: u32 },
    Completed { cycles: u32 },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Stopped { .. } | RunState::Completed { .. })
    }
}

/// What a worker was asked to do for one task.
#[derive(Debug, Clone)]
pub struct Mission {
    pub task_id: TaskId,
    /// Identity this worker reports under.
    pub node_id: NodeId,
    /// Where captured frames are relayed.
    pub destination: Address,
}

struct RunHandle {
    cancel: CancellationToken,
    state: watch::Receiver<RunState>,
    join: Option<JoinHandle<RunState>>,
}

struct Shared {
    cfg: RunnerConfig,
    capture: Arc<dyn Capture>,
    relay: Arc<dyn ImageRelay>,
    aggregator: Aggregator,
    metrics: MetricsHandle,
}

/// Supervises capture loops keyed by task id.
#[derive(Clone)]
pub struct TaskRunner {
    shared: Arc<Shared>,
    handles: Arc<Mutex<HashMap<TaskId, RunHandle>>>,
}

impl TaskRunner {
    pub fn new(
        cfg: RunnerConfig,
        capture: Arc<dyn Capture>,
        relay: Arc<dyn ImageRelay>,
        aggregator: Aggregator,
    ) -> Self {
        Self::with_metrics(cfg, capture, relay, aggregator, metrics::noop())
    }

    pub fn with_metrics(
        cfg: RunnerConfig,
        capture: Arc<dyn Capture>,
        relay: Arc<dyn ImageRelay>,
        aggregator: Aggregator,
        metrics: MetricsHandle,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                capture,
                relay,
                aggregator,
                metrics,
            }),
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn the capture loop for `mission`.
    ///
    /// A finished loop for the same task may be replaced; a live one may not.
    /// `on_admit` runs under the runner lock once admission succeeded and
    /// before the loop is spawned. Handles of loops that already ended are
    /// dropped here.
    pub fn start(
        &self,
        mission: Mission,
        on_admit: impl FnOnce(),
    ) -> Result<watch::Receiver<RunState>, CoreError> {
        let mut handles = self.lock();
        if let Some(existing) = handles.get(&mission.task_id)
            && !existing.state.borrow().is_terminal()
        {
            return Err(CoreError::AlreadyRunning(mission.task_id));
        }

        let before = handles.len();
        handles.retain(|_, h| !h.state.borrow().is_terminal());
        if handles.len() < before {
            debug!(pruned = before - handles.len(), "ended capture loops forgotten");
        }
        on_admit();

        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(RunState::Idle);
        let task_id = mission.task_id.clone();
        let join = tokio::spawn(Arc::clone(&self.shared).run(mission, cancel.clone(), tx));

        handles.insert(
            task_id,
            RunHandle {
                cancel,
                state: rx.clone(),
                join: Some(join),
            },
        );
        Ok(rx)
    }

    /// Request cancellation. Takes effect at the loop's next poll point.
    pub fn stop(&self, task: &TaskId) -> Result<(), CoreError> {
        let handles = self.lock();
        let handle = handles
            .get(task)
            .ok_or_else(|| CoreError::TaskNotFound(task.clone()))?;
        handle.cancel.cancel();
        debug!(%task, "cancellation requested");
        Ok(())
    }

    /// State of the loop for `task`. Ended loops are remembered until the
    /// next [`TaskRunner::start`].
    pub fn state(&self, task: &TaskId) -> Option<RunState> {
        self.lock().get(task).map(|h| *h.state.borrow())
    }

    pub fn is_active(&self, task: &TaskId) -> bool {
        self.state(task).is_some_and(|s| !s.is_terminal())
    }

    /// Number of loops that have not reached a terminal state.
    pub fn active(&self) -> usize {
        self.lock()
            .values()
            .filter(|h| !h.state.borrow().is_terminal())
            .count()
    }

    /// Wait until the loop for `task` reaches a terminal state.
    pub async fn wait(&self, task: &TaskId) -> Result<RunState, CoreError> {
        let mut rx = self
            .lock()
            .get(task)
            .map(|h| h.state.clone())
            .ok_or_else(|| CoreError::TaskNotFound(task.clone()))?;

        let result = rx.wait_for(RunState::is_terminal).await.map(|s| *s);
        Ok(result.unwrap_or_else(|_| *rx.borrow()))
    }

    /// Cancel every loop and wait for all of them to exit.
    pub async fn shutdown(&self) {
        let joins: Vec<_> = {
            let mut handles = self.lock();
            handles
                .iter_mut()
                .filter_map(|(id, h)| {
                    h.cancel.cancel();
                    h.join.take().map(|j| (id.clone(), j))
                })
                .collect()
        };

        for (task, join) in joins {
            match join.await {
                Ok(state) => debug!(%task, ?state, "capture loop joined"),
                Err(e) => warn!(%task, error = %e, "capture loop ended abnormally"),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, RunHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Shared {
    async fn run(
        self: Arc<Self>,
        mission: Mission,
        cancel: CancellationToken,
        state: watch::Sender<RunState>,
    ) -> RunState {
        info!(
            task = %mission.task_id,
            node = %mission.node_id,
            cycles = self.cfg.cycles,
            interval_ms = self.cfg.interval.as_millis() as u64,
            "capture loop started"
        );
        state.send_replace(RunState::Running { cycles: 0 });

        let mut done = 0;
        let finished = loop {
            if done >= self.cfg.cycles {
                break RunState::Completed { cycles: done };
            }
            tokio::time::sleep(self.cfg.interval).await;
            if cancel.is_cancelled() {
                break RunState::Stopped { cycles: done };
            }
            self.cycle(&mission, done).await;
            done += 1;
            state.send_replace(RunState::Running { cycles: done });
        };

        info!(task = %mission.task_id, state = ?finished, "capture loop ended");
        self.report(&mission, finished).await;
        state.send_replace(finished);
        finished
    }

    /// Capture and relay one frame. Errors are logged and swallowed.
    async fn cycle(&self, mission: &Mission, sequence: u32) {
        let payload = match self.grab(mission, sequence).await {
            Some(payload) => payload,
            None => {
                self.metrics.record_cycle(CycleOutcome::CaptureFailed);
                return;
            }
        };

        let frame = Frame {
            task_id: mission.task_id.clone(),
            node_id: mission.node_id.clone(),
            sequence,
            payload,
        };
        match self.relay.send(&mission.destination, frame).await {
            Ok(status) => {
                debug!(task = %mission.task_id, sequence, status, "frame relayed");
                self.metrics.record_cycle(CycleOutcome::Relayed);
            }
            Err(e) => {
                warn!(task = %mission.task_id, sequence, error = %e, "frame relay failed");
                self.metrics.record_cycle(CycleOutcome::RelayFailed);
            }
        }
    }

    async fn grab(&self, mission: &Mission, sequence: u32) -> Option<Vec<u8>> {
        match self.capture.capture(&mission.task_id, sequence).await {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(task = %mission.task_id, sequence, error = %e, "capture failed");
                None
            }
        }
    }

    async fn report(&self, mission: &Mission, finished: RunState) {
        let (task, node) = (&mission.task_id, &mission.node_id);
        let result = match finished {
            RunState::Completed { .. } => self.aggregator.report_node_finished(task, node).await,
            RunState::Stopped { .. } => self.aggregator.report_node_stopped(task, node).await,
            RunState::Idle | RunState::Running { .. } => return,
        };
        if let Err(e) = result {
            warn!(%task, %node, error = %e, "could not record loop outcome");
        }
    }
}
