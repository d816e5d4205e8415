//! Model-aware scheduler for the vision cluster.
//!
//! Routes generation jobs to the worker that already has the requested model
//! resident in GPU memory, falling back to a model swap on the least-loaded
//! available worker. Diffusion-class models take seconds to tens of seconds
//! to load, so sticky routing buys throughput at the cost of perfect balance.
//!
//! The dispatcher is a single task. The swap-or-not decision needs a
//! serialized view of which worker holds which model; do not parallelize it.
//! Generation calls run on per-job sub-tasks so the dispatcher keeps polling.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use muster_events::EventBus;
use muster_proto::{
    CoreError, CoreResult, JobPriority, NodeStatus, VisionHeartbeat, VisionJob, VisionJobStatus,
    VisionNode,
};
use muster_store::{StateStore, keys};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

// Priority bands keep sorted-set scores integer-exact in an f64: the rank
// band dwarfs any millisecond timestamp this century.
const PRIORITY_BAND: f64 = 1.0e14;

// ─── Routing decision ─────────────────────────────────────────────────────────

/// Where the next job should go.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Worker already holds the model; dispatch immediately.
    DispatchTo(VisionNode),
    /// No resident worker; swap the model on this one first.
    SwapThenDispatch(VisionNode),
    /// Nobody can take work right now.
    NoWorker,
}

/// Pick a worker for `target_model`.
///
/// Preference order: available worker with the model resident (lowest GPU
/// utilization wins), then any available worker (lowest utilization, will
/// swap), then none.
pub fn select_route(
    nodes: &[VisionNode],
    target_model: &str,
    now: chrono::DateTime<Utc>,
) -> Route {
    let available: Vec<&VisionNode> = nodes.iter().filter(|n| n.is_available(now)).collect();

    let resident = available
        .iter()
        .filter(|n| n.current_model.as_deref() == Some(target_model))
        .min_by_key(|n| n.gpu_util);
    if let Some(node) = resident {
        return Route::DispatchTo((*node).clone());
    }

    match available.iter().min_by_key(|n| n.gpu_util) {
        Some(node) => Route::SwapThenDispatch((*node).clone()),
        None => Route::NoWorker,
    }
}

// ─── Worker API seam ──────────────────────────────────────────────────────────

/// HTTP surface of a vision worker, as seen from the dispatcher.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// Ask the worker to unload its model and load `model`.
    async fn switch_model(&self, node: &VisionNode, model: &str) -> CoreResult<()>;
    /// Run one generation request to completion.
    async fn generate(
        &self,
        node: &VisionNode,
        request: &serde_json::Value,
    ) -> CoreResult<serde_json::Value>;
    /// Best-effort cancellation of an in-flight generation.
    async fn cancel(&self, node: &VisionNode, job_id: &str) -> CoreResult<()>;
}

/// Production implementation speaking to the worker's inference server.
pub struct HttpWorkerApi {
    client: reqwest::Client,
}

impl HttpWorkerApi {
    const SWITCH_TIMEOUT: Duration = Duration::from_secs(30);
    const GENERATE_TIMEOUT: Duration = Duration::from_secs(300);
    const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpWorkerApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerApi for HttpWorkerApi {
    async fn switch_model(&self, node: &VisionNode, model: &str) -> CoreResult<()> {
        let url = format!("{}/models/switch", node.base_url());
        let resp = self
            .client
            .post(&url)
            .timeout(Self::SWITCH_TIMEOUT)
            .json(&serde_json::json!({"model_name": model}))
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("switch request to {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(CoreError::Transient(format!(
                "switch on {} returned {}",
                node.node_id,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn generate(
        &self,
        node: &VisionNode,
        request: &serde_json::Value,
    ) -> CoreResult<serde_json::Value> {
        let url = format!("{}/generate", node.base_url());
        let resp = self
            .client
            .post(&url)
            .timeout(Self::GENERATE_TIMEOUT)
            .json(request)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("generate request to {url}: {e}")))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Transient(format!("generate response from {url}: {e}")))?;
        if !status.is_success() {
            return Err(CoreError::Transient(format!(
                "generate on {} returned {status}: {body}",
                node.node_id
            )));
        }
        Ok(body)
    }

    async fn cancel(&self, node: &VisionNode, job_id: &str) -> CoreResult<()> {
        let url = format!("{}/cancel/{job_id}", node.base_url());
        self.client
            .post(&url)
            .timeout(Self::CANCEL_TIMEOUT)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("cancel request to {url}: {e}")))?;
        Ok(())
    }
}

// ─── Worker pool view ─────────────────────────────────────────────────────────

/// Hash-backed view of the vision worker fleet (`vision:nodes`).
#[derive(Clone)]
pub struct VisionPool {
    store: Arc<dyn StateStore>,
}

impl VisionPool {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Merge a worker heartbeat. Unknown workers register implicitly; a held
    /// job id survives heartbeats because only the dispatcher assigns work.
    pub async fn heartbeat(&self, hb: VisionHeartbeat) -> CoreResult<()> {
        if !muster_proto::validate_node_id(&hb.node_id) {
            return Err(CoreError::Validation(format!(
                "invalid node id: {:?}",
                hb.node_id
            )));
        }

        let node = match self.get(&hb.node_id).await? {
            Some(mut existing) => {
                existing.hostname = hb.hostname;
                existing.ip = hb.ip;
                existing.port = hb.port;
                existing.gpu_util = hb.gpu_util;
                existing.status = hb.status;
                if hb.current_model.is_some() {
                    existing.current_model = hb.current_model;
                }
                existing.last_heartbeat = Utc::now();
                existing
            }
            None => VisionNode::from(hb),
        };
        self.save(&node).await
    }

    pub async fn get(&self, node_id: &str) -> CoreResult<Option<VisionNode>> {
        let Some(raw) = self.store.hget(keys::VISION_NODES, node_id).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub async fn save(&self, node: &VisionNode) -> CoreResult<()> {
        self.store
            .hset(
                keys::VISION_NODES,
                &node.node_id,
                &serde_json::to_string(node)?,
            )
            .await
    }

    pub async fn nodes(&self) -> CoreResult<Vec<VisionNode>> {
        let mut nodes: Vec<VisionNode> = self
            .store
            .hgetall(keys::VISION_NODES)
            .await?
            .into_values()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    /// Mark workers with stale heartbeats offline.
    pub async fn sweep_offline(&self) -> CoreResult<u32> {
        let now = Utc::now();
        let mut swept = 0;
        for mut node in self.nodes().await? {
            if !node.is_online(now) && node.status != NodeStatus::Offline {
                node.status = NodeStatus::Offline;
                self.save(&node).await?;
                warn!(node = %node.node_id, "vision worker went offline");
                swept += 1;
            }
        }
        Ok(swept)
    }
}

// ─── Scheduler ────────────────────────────────────────────────────────────────

/// Wait/backoff knobs, shortened in tests.
#[derive(Debug, Clone)]
pub struct SchedulerTiming {
    /// Sleep when the queue is empty.
    pub idle_sleep: Duration,
    /// Backoff after finding no available worker.
    pub no_worker_backoff: Duration,
    /// Heartbeat poll interval while a swap is in flight.
    pub swap_poll: Duration,
    /// Total budget for a model swap before the worker is written off.
    pub swap_timeout: Duration,
}

impl Default for SchedulerTiming {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_millis(500),
            no_worker_backoff: Duration::from_secs(1),
            swap_poll: Duration::from_secs(2),
            swap_timeout: Duration::from_secs(120),
        }
    }
}

/// What one dispatcher iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Queue was empty.
    Idle,
    /// A job was popped but no worker could take it; job re-queued.
    NoWorker,
    /// Job handed to a worker (generation continues on a sub-task).
    Dispatched,
    /// Swap was required and did not complete; job failed.
    SwapFailed,
}

/// Cluster snapshot written to `vision:scheduler:status`.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub total: u32,
    pub online: u32,
    pub busy: u32,
    pub switching: u32,
    pub offline: u32,
    pub queue_pending: u64,
    pub models_loaded: HashMap<String, Vec<String>>,
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    pool: VisionPool,
    worker: Arc<dyn WorkerApi>,
    timing: SchedulerTiming,
}

impl Scheduler {
    pub fn new(store: Arc<dyn StateStore>, bus: EventBus, worker: Arc<dyn WorkerApi>) -> Self {
        let pool = VisionPool::new(store.clone());
        Self {
            store,
            bus,
            pool,
            worker,
            timing: SchedulerTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: SchedulerTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn pool(&self) -> &VisionPool {
        &self.pool
    }

    // ── Queue operations ─────────────────────────────────────────────────────

    /// Enqueue a generation request. Higher priority drains first; equal
    /// priority drains in submission order.
    pub async fn submit(
        &self,
        request: serde_json::Value,
        target_model: String,
        priority: JobPriority,
    ) -> CoreResult<VisionJob> {
        if target_model.trim().is_empty() {
            return Err(CoreError::Validation("target model must not be empty".into()));
        }
        let job = VisionJob::new(request, target_model, priority);
        self.save_job(&job).await?;
        self.store
            .zadd(keys::VISION_QUEUE, Self::score(&job), &job.id.to_string())
            .await?;

        info!(job = %job.id, model = %job.target_model, priority = %job.priority, "vision job queued");
        self.bus
            .fleet_event(
                "vision_job_queued",
                serde_json::json!({"job_id": job.id, "model": job.target_model}),
            )
            .await;
        Ok(job)
    }

    pub async fn job(&self, id: Uuid) -> CoreResult<VisionJob> {
        let raw = self
            .store
            .hget(keys::VISION_JOBS, &id.to_string())
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("vision job {id}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Cancel a job. Pending jobs leave the queue; running jobs get a
    /// best-effort cancel forwarded to their worker.
    pub async fn cancel(&self, id: Uuid) -> CoreResult<VisionJob> {
        let mut job = self.job(id).await?;
        if job.status == VisionJobStatus::Cancelled {
            return Ok(job);
        }
        if job.status.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "vision job {id} is {:?}",
                job.status
            )));
        }

        self.store.zrem(keys::VISION_QUEUE, &id.to_string()).await?;

        if job.status == VisionJobStatus::Running
            && let Some(node_id) = &job.assigned_node
            && let Some(node) = self.pool.get(node_id).await?
        {
            if let Err(e) = self.worker.cancel(&node, &id.to_string()).await {
                warn!(job = %id, node = %node_id, error = %e, "cancel forward failed");
            }
        }

        job.status = VisionJobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.save_job(&job).await?;
        self.bus
            .fleet_event("vision_job_cancelled", serde_json::json!({"job_id": id}))
            .await;
        Ok(job)
    }

    /// Operator-requested model switch on a specific worker, outside the
    /// dispatch path. The worker goes `switching` and comes back via its own
    /// heartbeat.
    pub async fn force_switch(&self, node_id: &str, model: &str) -> CoreResult<()> {
        if model.trim().is_empty() {
            return Err(CoreError::Validation("model name must not be empty".into()));
        }
        let mut node = self
            .pool
            .get(node_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("vision node {node_id}")))?;
        if node.current_job_id.is_some() {
            return Err(CoreError::Conflict(format!(
                "node {node_id} is running a job"
            )));
        }

        self.worker.switch_model(&node, model).await?;
        node.status = NodeStatus::Switching;
        node.current_model = None;
        self.pool.save(&node).await?;

        info!(node = %node_id, model, "operator model switch started");
        self.bus
            .fleet_event(
                "model_switch_started",
                serde_json::json!({"node": node_id, "model": model}),
            )
            .await;
        Ok(())
    }

    pub async fn status(&self) -> CoreResult<SchedulerStatus> {
        let nodes = self.pool.nodes().await?;
        let mut status = SchedulerStatus {
            total: nodes.len() as u32,
            online: 0,
            busy: 0,
            switching: 0,
            offline: 0,
            queue_pending: self.store.zcard(keys::VISION_QUEUE).await?,
            models_loaded: HashMap::new(),
        };
        for node in &nodes {
            match node.status {
                NodeStatus::Online => status.online += 1,
                NodeStatus::Busy => status.busy += 1,
                NodeStatus::Switching => status.switching += 1,
                NodeStatus::Offline => status.offline += 1,
            }
            if let Some(model) = &node.current_model {
                status
                    .models_loaded
                    .entry(model.clone())
                    .or_default()
                    .push(node.hostname.clone());
            }
        }
        Ok(status)
    }

    // ── Dispatch loop ────────────────────────────────────────────────────────

    /// Run the dispatcher until shutdown. One cycle's error never stops the
    /// loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("vision scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = self.tick() => outcome,
            };

            let sleep = match outcome {
                Ok(TickOutcome::Idle) => Some(self.timing.idle_sleep),
                Ok(TickOutcome::NoWorker) => Some(self.timing.no_worker_backoff),
                Ok(_) => None,
                Err(e) => {
                    error!(error = %e, "scheduler cycle failed");
                    self.bus
                        .fleet_event(
                            "error",
                            serde_json::json!({"component": "scheduler", "error": e.to_string()}),
                        )
                        .await;
                    Some(self.timing.no_worker_backoff)
                }
            };
            if let Some(d) = sleep {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(d) => {}
                }
            }
        }
        info!("vision scheduler stopped");
    }

    /// One dispatcher iteration: pop, route, swap if needed, dispatch.
    pub async fn tick(&self) -> CoreResult<TickOutcome> {
        self.pool.sweep_offline().await?;

        let Some((id_str, score)) = self.store.zpop_min(keys::VISION_QUEUE).await? else {
            return Ok(TickOutcome::Idle);
        };
        let id = Uuid::parse_str(&id_str)
            .map_err(|_| CoreError::Validation(format!("bad vision job id: {id_str}")))?;
        let mut job = match self.job(id).await {
            Ok(job) => job,
            Err(CoreError::NotFound(_)) => {
                warn!(job = %id_str, "queued vision job vanished, dropping");
                return Ok(TickOutcome::Idle);
            }
            Err(e) => return Err(e),
        };
        if job.status != VisionJobStatus::Pending {
            return Ok(TickOutcome::Idle);
        }

        job.status = VisionJobStatus::Routing;
        self.save_job(&job).await?;

        let nodes = self.pool.nodes().await?;
        let route = select_route(&nodes, &job.target_model, Utc::now());

        let node = match route {
            Route::NoWorker => {
                // Re-queue under the job's own score so it keeps its place in
                // line rather than falling behind newer submissions.
                job.status = VisionJobStatus::Pending;
                self.save_job(&job).await?;
                self.store
                    .zadd(keys::VISION_QUEUE, score, &id_str)
                    .await?;
                return Ok(TickOutcome::NoWorker);
            }
            Route::DispatchTo(node) => node,
            Route::SwapThenDispatch(node) => {
                match self.swap_model(node, &mut job).await? {
                    Some(node) => node,
                    None => return Ok(TickOutcome::SwapFailed),
                }
            }
        };

        self.dispatch(job, node).await?;
        self.write_status().await;
        Ok(TickOutcome::Dispatched)
    }

    /// Drive a model swap to completion, or fail the job and write the
    /// worker off as offline on timeout.
    async fn swap_model(
        &self,
        mut node: VisionNode,
        job: &mut VisionJob,
    ) -> CoreResult<Option<VisionNode>> {
        info!(job = %job.id, node = %node.node_id, model = %job.target_model, "model swap required");
        job.status = VisionJobStatus::ModelSwitching;
        self.save_job(job).await?;
        self.bus
            .fleet_event(
                "model_switch_started",
                serde_json::json!({"node": node.node_id, "model": job.target_model}),
            )
            .await;

        if let Err(e) = self.worker.switch_model(&node, &job.target_model).await {
            warn!(node = %node.node_id, error = %e, "model switch request failed");
            self.fail_job(job, format!("model switch failed: {e}")).await?;
            return Ok(None);
        }

        node.status = NodeStatus::Switching;
        node.current_model = None;
        node.current_job_id = None;
        self.pool.save(&node).await?;

        // Poll the worker's heartbeat view until it reports the new model.
        let deadline = tokio::time::Instant::now() + self.timing.swap_timeout;
        loop {
            tokio::time::sleep(self.timing.swap_poll).await;

            if let Some(current) = self.pool.get(&node.node_id).await?
                && current.current_model.as_deref() == Some(job.target_model.as_str())
                && current.status == NodeStatus::Online
            {
                return Ok(Some(current));
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(node = %node.node_id, model = %job.target_model, "model swap timed out");
                self.bus
                    .fleet_event(
                        "model_switch_timeout",
                        serde_json::json!({"node": node.node_id, "model": job.target_model}),
                    )
                    .await;
                if let Some(mut stale) = self.pool.get(&node.node_id).await? {
                    stale.status = NodeStatus::Offline;
                    self.pool.save(&stale).await?;
                }
                self.fail_job(job, "model switch timed out".to_string()).await?;
                return Ok(None);
            }
        }
    }

    /// Hand the job to the worker and record the result on a sub-task so the
    /// dispatcher keeps running. At most one job per worker at a time.
    async fn dispatch(&self, mut job: VisionJob, mut node: VisionNode) -> CoreResult<()> {
        debug_assert_eq!(node.current_model.as_deref(), Some(job.target_model.as_str()));

        node.status = NodeStatus::Busy;
        node.current_job_id = Some(job.id.to_string());
        self.pool.save(&node).await?;

        job.status = VisionJobStatus::Running;
        job.assigned_node = Some(node.node_id.clone());
        job.started_at = Some(Utc::now());
        self.save_job(&job).await?;

        info!(job = %job.id, node = %node.node_id, "vision job dispatched");
        self.bus
            .fleet_event(
                "vision_job_dispatched",
                serde_json::json!({"job_id": job.id, "node": node.node_id}),
            )
            .await;

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_generation(job, node).await {
                error!(error = %e, "generation sub-task failed to record result");
            }
        });
        Ok(())
    }

    async fn run_generation(&self, mut job: VisionJob, node: VisionNode) -> CoreResult<()> {
        let outcome = self.worker.generate(&node, &job.request).await;

        match outcome {
            Ok(result) => {
                job.status = VisionJobStatus::Completed;
                job.result = Some(result);
                job.completed_at = Some(Utc::now());
                self.save_job(&job).await?;
                info!(job = %job.id, node = %node.node_id, "vision job completed");
                self.bus
                    .fleet_event(
                        "vision_job_completed",
                        serde_json::json!({"job_id": job.id, "node": node.node_id}),
                    )
                    .await;
            }
            Err(e) => {
                // If the operator cancelled mid-flight, keep that terminal state.
                if self.job(job.id).await?.status != VisionJobStatus::Cancelled {
                    self.fail_job(&mut job, e.to_string()).await?;
                }
            }
        }

        // Release the worker regardless of outcome.
        let id_str = job.id.to_string();
        if let Some(mut current) = self.pool.get(&node.node_id).await?
            && current.current_job_id.as_deref() == Some(id_str.as_str())
        {
            current.current_job_id = None;
            if current.status == NodeStatus::Busy {
                current.status = NodeStatus::Online;
            }
            self.pool.save(&current).await?;
        }
        self.write_status().await;
        Ok(())
    }

    async fn fail_job(&self, job: &mut VisionJob, error: String) -> CoreResult<()> {
        job.status = VisionJobStatus::Failed;
        job.error = Some(error.clone());
        job.completed_at = Some(Utc::now());
        self.save_job(job).await?;
        self.bus
            .fleet_event(
                "vision_job_failed",
                serde_json::json!({"job_id": job.id, "error": error}),
            )
            .await;
        Ok(())
    }

    async fn save_job(&self, job: &VisionJob) -> CoreResult<()> {
        self.store
            .hset(
                keys::VISION_JOBS,
                &job.id.to_string(),
                &serde_json::to_string(job)?,
            )
            .await
    }

    async fn write_status(&self) {
        match self.status().await {
            Ok(status) => {
                if let Ok(raw) = serde_json::to_string(&status) {
                    let _ = self.store.set(keys::VISION_SCHEDULER_STATUS, &raw).await;
                }
            }
            Err(e) => warn!(error = %e, "failed to compute scheduler status"),
        }
    }

    fn score(job: &VisionJob) -> f64 {
        let rank = match job.priority {
            JobPriority::High => 0.0,
            JobPriority::Normal => 1.0,
            JobPriority::Low => 2.0,
        };
        rank * PRIORITY_BAND + job.created_at.timestamp_millis() as f64
    }
}
