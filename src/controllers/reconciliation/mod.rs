//! Queue-driven reconciliation of platform deployments.
//!
//! A fixed pool of workers pulls [`ReconcileWork`] from a bounded queue and
//! hands each deployment to the [`ServiceReconciler`]. Outcomes flow through a
//! single result processor that persists status, schedules retries and fires
//! notifications. Periodic jobs pick up pending deployments, move parked work
//! back into the queue and sync drift from the orchestrator.

mod drift;
mod queue;
mod results;
mod worker;

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::queue::WorkQueue;
use self::results::WorkOutcome;
use crate::controllers::Diagnostics;
use crate::notifications::NotificationSender;
use crate::orchestrator::Orchestrator;
use crate::reconcilers::ServiceReconciler;
use crate::repository::Repository;
use crate::types::DeploymentStatus;
use crate::{Error, Metrics, Result};

pub use self::drift::{image_git_sha, image_version, observed_health};
pub use self::queue::RETRY_HIGH_WATER;

/// Slots in the channel between workers and the result processor
pub const RESULT_QUEUE_CAPACITY: usize = 100;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub schedule_interval: Duration,
    pub drift_sync_interval: Duration,
    pub retry_drain_interval: Duration,
    /// Attempts after which a retryable failure becomes permanent
    pub max_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            workers: 5,
            queue_capacity: 100,
            schedule_interval: Duration::from_secs(30),
            drift_sync_interval: Duration::from_secs(60),
            retry_drain_interval: Duration::from_secs(2),
            max_attempts: 10,
        }
    }
}

/// One reconciliation of one deployment
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileWork {
    pub deployment_id: Uuid,
    /// Higher is older or retried more often
    pub priority: i64,
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
}

impl ReconcileWork {
    pub fn new(deployment_id: Uuid, priority: i64) -> Self {
        ReconcileWork {
            deployment_id,
            priority,
            attempt: 1,
            scheduled_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ControllerStatus {
    pub started: bool,
    pub workers: usize,
    pub work_queue: usize,
    pub work_queue_capacity: usize,
    pub result_queue: usize,
    pub result_queue_capacity: usize,
    pub retry_queue: usize,
    pub dropped_work_total: u64,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueuePressure {
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub dropped_work: u64,
    pub retry_queue: usize,
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Controller {
    repo: Arc<dyn Repository>,
    orchestrator: Arc<dyn Orchestrator>,
    reconciler: ServiceReconciler,
    notifier: Arc<dyn NotificationSender>,
    metrics: Metrics,
    diagnostics: Arc<RwLock<Diagnostics>>,
    config: ControllerConfig,
    queue: WorkQueue,
    results_tx: mpsc::Sender<WorkOutcome>,
    results_rx: Mutex<mpsc::Receiver<WorkOutcome>>,
    /// Current attempt of every deployment with a live work chain
    inflight: std::sync::Mutex<HashMap<Uuid, u32>>,
    /// Start/stop state, kept apart from the queue locks
    lifecycle: Mutex<Lifecycle>,
    started: AtomicBool,
}

impl Controller {
    pub fn new(
        repo: Arc<dyn Repository>,
        orchestrator: Arc<dyn Orchestrator>,
        notifier: Arc<dyn NotificationSender>,
        config: ControllerConfig,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::channel(RESULT_QUEUE_CAPACITY);
        Controller {
            reconciler: ServiceReconciler::new(orchestrator.clone()),
            repo,
            orchestrator,
            notifier,
            metrics: Metrics::default(),
            diagnostics: Arc::default(),
            queue: WorkQueue::new(config.queue_capacity),
            config,
            results_tx,
            results_rx: Mutex::new(results_rx),
            inflight: std::sync::Mutex::default(),
            lifecycle: Mutex::default(),
            started: AtomicBool::new(false),
        }
    }

    /// Use registered metrics instead of the detached defaults
    pub fn with_metrics(self, metrics: Metrics) -> Self {
        Self { metrics, ..self }
    }

    pub fn with_diagnostics(self, diagnostics: Arc<RwLock<Diagnostics>>) -> Self {
        Self {
            diagnostics,
            ..self
        }
    }

    /// Launches the workers, the result processor and the periodic jobs.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.started.load(Ordering::Acquire) {
            return Err(Error::AlreadyStarted);
        }

        // Chains from a previous run died with its tasks
        self.inflight().clear();

        let (shutdown, signal) = watch::channel(false);
        let workers = self.config.workers.max(1);
        for worker_id in 0..workers {
            lifecycle
                .tasks
                .push(tokio::spawn(self.clone().run_worker(worker_id, signal.clone())));
        }
        lifecycle
            .tasks
            .push(tokio::spawn(self.clone().process_results(signal.clone())));
        lifecycle
            .tasks
            .push(tokio::spawn(self.clone().run_scheduler(signal.clone())));
        lifecycle
            .tasks
            .push(tokio::spawn(self.clone().run_drift_sync(signal.clone())));
        lifecycle
            .tasks
            .push(tokio::spawn(self.clone().run_retry_drainer(signal)));
        lifecycle.shutdown = Some(shutdown);
        self.started.store(true, Ordering::Release);

        info!(
            workers,
            queue_capacity = self.queue.capacity(),
            "Reconciliation controller started"
        );
        Ok(())
    }

    /// Signals shutdown and waits for every background task to exit.
    ///
    /// In-flight work finishes its current step; nothing new is picked up.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Stopping reconciliation controller");
        if let Some(shutdown) = lifecycle.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for task in lifecycle.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(error = %err, "Controller task ended abnormally");
            }
        }
        info!("Reconciliation controller stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Queues a first attempt at reconciling `deployment_id`.
    ///
    /// A deployment already queued, running or waiting on a retry is left to
    /// that chain. [`Error::QueueFull`] means the work was parked in the retry
    /// queue, not discarded.
    pub fn schedule_reconciliation(&self, deployment_id: Uuid, priority: i64) -> Result<()> {
        match self.inflight().entry(deployment_id) {
            Entry::Occupied(current) => {
                debug!(
                    deployment_id = %deployment_id,
                    attempt = *current.get(),
                    "Reconciliation already in flight"
                );
                return Ok(());
            }
            Entry::Vacant(slot) => {
                slot.insert(1);
            }
        }
        self.enqueue(ReconcileWork::new(deployment_id, priority))
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<Uuid, u32>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, work: ReconcileWork) -> Result<()> {
        let deployment_id = work.deployment_id;
        let (priority, attempt) = (work.priority, work.attempt);
        let admitted = self.queue.admit(work);
        match &admitted {
            Ok(()) => debug!(
                deployment_id = %deployment_id,
                priority,
                attempt,
                "Scheduled reconciliation work"
            ),
            Err(_) => self.metrics.dropped_work.inc(),
        }
        self.record_queue_depths();
        admitted
    }

    fn record_queue_depths(&self) {
        self.metrics
            .set_queue_depths(self.queue.len(), self.queue.retry_len());
    }

    fn result_queue_len(&self) -> usize {
        RESULT_QUEUE_CAPACITY - self.results_tx.capacity()
    }

    pub fn get_status(&self) -> ControllerStatus {
        ControllerStatus {
            started: self.is_started(),
            workers: self.config.workers,
            work_queue: self.queue.len(),
            work_queue_capacity: self.queue.capacity(),
            result_queue: self.result_queue_len(),
            result_queue_capacity: RESULT_QUEUE_CAPACITY,
            retry_queue: self.queue.retry_len(),
            dropped_work_total: self.queue.dropped(),
        }
    }

    pub fn get_queue_pressure(&self) -> QueuePressure {
        QueuePressure {
            queue_size: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            dropped_work: self.queue.dropped(),
            retry_queue: self.queue.retry_len(),
        }
    }

    /// Fails when not started or when either bounded channel is full.
    pub fn health_check(&self) -> Result<()> {
        if !self.is_started() {
            return Err(Error::NotStarted);
        }
        if self.queue.len() >= self.queue.capacity() {
            return Err(Error::QueueSaturated("work"));
        }
        if self.result_queue_len() >= RESULT_QUEUE_CAPACITY {
            return Err(Error::QueueSaturated("result"));
        }
        Ok(())
    }

    /// Literal environment of a running pod's first container
    pub async fn get_pod_env_vars(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<BTreeMap<String, String>> {
        self.orchestrator.get_pod_env_vars(namespace, pod).await
    }

    async fn run_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.schedule_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.schedule_pending_work().await,
            }
        }
        debug!("Work scheduler stopped");
    }

    /// Enqueues every pending deployment, oldest with the highest priority.
    pub async fn schedule_pending_work(&self) {
        let pending = match self
            .repo
            .list_deployments_by_status(DeploymentStatus::Pending)
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "Failed to list pending deployments");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        debug!(count = pending.len(), "Scheduling pending deployments");
        let now = Utc::now();
        for deployment in pending {
            let priority = (now - deployment.created_at).num_minutes();
            if let Err(err) = self.schedule_reconciliation(deployment.id, priority) {
                debug!(deployment_id = %deployment.id, error = %err, "Pending deployment deferred");
            }
        }
    }

    async fn run_retry_drainer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.retry_drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.drain_retry_queue(),
            }
        }
        debug!("Retry drainer stopped");
    }

    fn drain_retry_queue(&self) {
        let moved = self.queue.drain_retry();
        if moved > 0 {
            debug!(
                moved,
                remaining = self.queue.retry_len(),
                "Drained retry queue to work queue"
            );
        }
        self.record_queue_depths();
    }
}
