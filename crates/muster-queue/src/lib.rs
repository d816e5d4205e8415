//! Priority job queue: three FIFO tiers that workers pull from.
//!
//! Scheduling order is strict priority (high, normal, low), FIFO within a
//! tier. A claimed job that fails its targeting filters goes back to the tail
//! of the same tier, so another worker can pick it up without starving the
//! queue. Completion is guarded by an assigned-node ownership check; a worker
//! can never complete a job it does not hold.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use muster_events::EventBus;
use muster_proto::{
    CoreError, CoreResult, Job, JobPriority, JobRequest, JobStatus, QueueDepths, clamp_progress,
};
use muster_store::{StateStore, keys};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Window for the processing-rate figure in [`QueueStats`].
const RATE_WINDOW_MINS: i64 = 5;

// ─── Records kept alongside the queue ─────────────────────────────────────────

/// One entry in the rolling completion history (rate computation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub job_type: String,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// One entry in the recent-failure list the doctor's job-failure detector reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job_type: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// How a worker finished a job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success(serde_json::Value),
    Failure(String),
}

/// In-memory filter for [`JobQueue::list`]. Full scan; intended for small N.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub assigned_node: Option<String>,
}

/// Snapshot returned by `GET /queue/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depths: QueueDepths,
    pub processing: u64,
    pub total_queued: i64,
    pub total_completed: i64,
    pub total_failed: i64,
    pub active_nodes: u64,
    /// Completions per minute over the trailing five minutes.
    pub processing_rate_per_min: f64,
    /// Queued jobs whose target node/cluster has no live worker.
    pub targeted_stuck: u64,
}

// ─── Queue ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    http: reqwest::Client,
}

impl JobQueue {
    pub fn new(store: Arc<dyn StateStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            http: reqwest::Client::new(),
        }
    }

    // ── Submit / read ────────────────────────────────────────────────────────

    pub async fn submit(&self, request: JobRequest) -> CoreResult<Job> {
        if request.job_type.trim().is_empty() {
            return Err(CoreError::Validation("job_type must not be empty".into()));
        }

        let job = Job::from_request(request);
        self.save(&job).await?;
        self.store
            .rpush(&keys::queue_list(job.priority), &job.id.to_string())
            .await?;
        self.store.incr_by(keys::STATS_QUEUED, 1).await?;

        info!(job = %job.id, job_type = %job.job_type, priority = %job.priority, "job queued");
        self.bus
            .fleet_event(
                "job_submitted",
                serde_json::json!({
                    "job_id": job.id,
                    "job_type": job.job_type,
                    "priority": job.priority,
                }),
            )
            .await;
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<Job> {
        let raw = self
            .store
            .get(&keys::job(id))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {id}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Full scan with in-memory filtering, newest first.
    pub async fn list(&self, filter: &JobFilter) -> CoreResult<Vec<Job>> {
        let mut jobs = Vec::new();
        for key in self.store.scan(keys::JOB_SCAN_PATTERN).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let job: Job = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    warn!(key, error = %e, "skipping corrupt job record");
                    continue;
                }
            };
            if let Some(status) = filter.status
                && job.status != status
            {
                continue;
            }
            if let Some(job_type) = &filter.job_type
                && &job.job_type != job_type
            {
                continue;
            }
            if let Some(node) = &filter.assigned_node
                && job.assigned_node.as_ref() != Some(node)
            {
                continue;
            }
            jobs.push(job);
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    // ── Cancel / retry ───────────────────────────────────────────────────────

    /// Cancel a queued or processing job. Cancelling an already-cancelled job
    /// is a no-op that returns the current record.
    pub async fn cancel(&self, id: Uuid) -> CoreResult<Job> {
        let mut job = self.get(id).await?;

        if job.status == JobStatus::Cancelled {
            return Ok(job);
        }
        if job.status.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "job {id} is {:?} and cannot be cancelled",
                job.status
            )));
        }

        let id_str = id.to_string();
        for priority in JobPriority::CLAIM_ORDER {
            self.store
                .lrem(&keys::queue_list(priority), &id_str)
                .await?;
        }
        self.store.srem(keys::QUEUE_PROCESSING, &id_str).await?;

        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.save(&job).await?;

        info!(job = %id, "job cancelled");
        self.bus
            .fleet_event("job_cancelled", serde_json::json!({"job_id": id}))
            .await;
        Ok(job)
    }

    /// Re-queue a failed or dead-lettered job with transient fields reset.
    pub async fn retry(&self, id: Uuid) -> CoreResult<Job> {
        let mut job = self.get(id).await?;

        if !matches!(job.status, JobStatus::Failed | JobStatus::Dead) {
            return Err(CoreError::Conflict(format!(
                "job {id} is {:?}; only failed or dead jobs can be retried",
                job.status
            )));
        }

        job.status = JobStatus::Queued;
        job.retry_count = 0;
        job.assigned_node = None;
        job.started_at = None;
        job.completed_at = None;
        job.progress = 0.0;
        job.progress_detail = None;
        job.result = None;
        job.error = None;
        self.save(&job).await?;
        self.store
            .rpush(&keys::queue_list(job.priority), &id.to_string())
            .await?;

        info!(job = %id, "job re-queued by operator retry");
        self.bus
            .fleet_event("job_retried", serde_json::json!({"job_id": id}))
            .await;
        Ok(job)
    }

    // ── Claim / complete / progress ──────────────────────────────────────────

    /// Pull the next compatible job for a worker: high, then normal, then low.
    ///
    /// One id is popped per tier; an incompatible pop goes back to the tail of
    /// the same tier so a matching worker can still drain it.
    pub async fn claim(
        &self,
        worker_id: &str,
        worker_cluster: Option<&str>,
        accepted_types: Option<&[String]>,
    ) -> CoreResult<Option<Job>> {
        for priority in JobPriority::CLAIM_ORDER {
            let queue_key = keys::queue_list(priority);
            let Some(id_str) = self.store.lpop(&queue_key).await? else {
                continue;
            };

            let id = Uuid::parse_str(&id_str)
                .map_err(|_| CoreError::Validation(format!("bad job id in queue: {id_str}")))?;
            let mut job = match self.get(id).await {
                Ok(job) => job,
                Err(CoreError::NotFound(_)) => {
                    // Record expired while the id sat in the list; drop it.
                    warn!(job = %id_str, "queued job record expired, dropping");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if job.status != JobStatus::Queued {
                continue;
            }

            if !job.compatible_with(worker_id, worker_cluster, accepted_types) {
                self.store.rpush(&queue_key, &id_str).await?;
                continue;
            }

            job.status = JobStatus::Processing;
            job.assigned_node = Some(worker_id.to_string());
            job.started_at = Some(Utc::now());
            self.save(&job).await?;
            self.store.sadd(keys::QUEUE_PROCESSING, &id_str).await?;

            info!(job = %id, worker = %worker_id, priority = %priority, "job claimed");
            return Ok(Some(job));
        }
        Ok(None)
    }

    /// Finish a job. Only the assigned worker may complete it; anyone else
    /// gets a conflict and the job state is untouched.
    pub async fn complete(&self, id: Uuid, worker_id: &str, outcome: JobOutcome) -> CoreResult<Job> {
        let mut job = self.get(id).await?;

        if job.status != JobStatus::Processing {
            return Err(CoreError::Conflict(format!(
                "job {id} is {:?}, not processing",
                job.status
            )));
        }
        if job.assigned_node.as_deref() != Some(worker_id) {
            return Err(CoreError::Conflict(format!(
                "job {id} is assigned to {:?}, not {worker_id}",
                job.assigned_node
            )));
        }

        let id_str = id.to_string();
        self.store.srem(keys::QUEUE_PROCESSING, &id_str).await?;

        match outcome {
            JobOutcome::Success(result) => {
                let now = Utc::now();
                job.status = JobStatus::Completed;
                job.progress = 100.0;
                job.result = Some(result);
                job.completed_at = Some(now);
                self.save(&job).await?;

                self.store.incr_by(keys::STATS_COMPLETED, 1).await?;
                self.record_completion(&job, now).await?;
                self.fire_callback(&job);

                info!(job = %id, worker = %worker_id, "job completed");
                self.bus
                    .fleet_event(
                        "job_completed",
                        serde_json::json!({"job_id": id, "node": worker_id}),
                    )
                    .await;
            }
            JobOutcome::Failure(error) => {
                job.retry_count += 1;
                job.error = Some(error.clone());

                if job.retry_count >= job.max_retries {
                    job.status = JobStatus::Dead;
                    job.completed_at = Some(Utc::now());
                    self.save(&job).await?;

                    self.store.incr_by(keys::STATS_FAILED, 1).await?;
                    self.record_failure(&job, &error).await?;

                    warn!(job = %id, retries = job.retry_count, "job dead-lettered");
                    self.bus
                        .fleet_event(
                            "job_dead",
                            serde_json::json!({"job_id": id, "error": error}),
                        )
                        .await;
                } else {
                    job.status = JobStatus::Queued;
                    job.assigned_node = None;
                    job.started_at = None;
                    job.progress = 0.0;
                    self.save(&job).await?;
                    self.store
                        .rpush(&keys::queue_list(job.priority), &id_str)
                        .await?;

                    info!(job = %id, retry = job.retry_count, max = job.max_retries, "job re-queued after failure");
                    self.bus
                        .fleet_event(
                            "job_requeued",
                            serde_json::json!({"job_id": id, "retry": job.retry_count}),
                        )
                        .await;
                }
            }
        }
        Ok(job)
    }

    /// Report progress for a processing job. Same ownership rule as complete.
    pub async fn update_progress(
        &self,
        id: Uuid,
        worker_id: &str,
        progress: f32,
        detail: Option<String>,
    ) -> CoreResult<Job> {
        let mut job = self.get(id).await?;

        if job.status != JobStatus::Processing {
            return Err(CoreError::Conflict(format!(
                "job {id} is {:?}, not processing",
                job.status
            )));
        }
        if job.assigned_node.as_deref() != Some(worker_id) {
            return Err(CoreError::Conflict(format!(
                "job {id} is assigned to {:?}, not {worker_id}",
                job.assigned_node
            )));
        }

        job.progress = clamp_progress(progress);
        if detail.is_some() {
            job.progress_detail = detail;
        }
        self.save(&job).await?;
        Ok(job)
    }

    // ── Stats ────────────────────────────────────────────────────────────────

    pub async fn depths(&self) -> CoreResult<QueueDepths> {
        Ok(QueueDepths {
            high: self
                .store
                .llen(&keys::queue_list(JobPriority::High))
                .await?,
            normal: self
                .store
                .llen(&keys::queue_list(JobPriority::Normal))
                .await?,
            low: self.store.llen(&keys::queue_list(JobPriority::Low)).await?,
        })
    }

    pub async fn stats(&self) -> CoreResult<QueueStats> {
        let depths = self.depths().await?;
        let processing = self.store.scard(keys::QUEUE_PROCESSING).await?;
        let active_nodes = self.store.scard(keys::NODES_ACTIVE).await?;

        let cutoff = Utc::now() - ChronoDuration::minutes(RATE_WINDOW_MINS);
        let recent = self
            .store
            .lrange(keys::STATS_COMPLETION_HISTORY, 0, -1)
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_str::<CompletionRecord>(raw).ok())
            .filter(|r| r.completed_at >= cutoff)
            .count();

        Ok(QueueStats {
            depths,
            processing,
            total_queued: self.counter(keys::STATS_QUEUED).await?,
            total_completed: self.counter(keys::STATS_COMPLETED).await?,
            total_failed: self.counter(keys::STATS_FAILED).await?,
            active_nodes,
            processing_rate_per_min: recent as f64 / RATE_WINDOW_MINS as f64,
            targeted_stuck: self.count_targeted_stuck().await?,
        })
    }

    /// Queued jobs whose targeting can never be satisfied by a live worker.
    /// Surfaced for observability only; no automatic action is taken.
    async fn count_targeted_stuck(&self) -> CoreResult<u64> {
        let active = self.store.smembers(keys::NODES_ACTIVE).await?;
        let mut stuck = 0u64;
        for job in self
            .list(&JobFilter {
                status: Some(JobStatus::Queued),
                ..Default::default()
            })
            .await?
        {
            if let Some(target) = &job.target_node {
                if !active.contains(target) {
                    stuck += 1;
                }
                continue;
            }
            if let Some(cluster) = &job.target_cluster {
                let members = self.store.smembers(&keys::cluster_nodes(cluster)).await?;
                if !members.iter().any(|m| active.contains(m)) {
                    stuck += 1;
                }
            }
        }
        Ok(stuck)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    async fn save(&self, job: &Job) -> CoreResult<()> {
        self.store
            .set_ex(&keys::job(job.id), &serde_json::to_string(job)?, keys::JOB_TTL)
            .await
    }

    async fn counter(&self, key: &str) -> CoreResult<i64> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn record_completion(&self, job: &Job, now: DateTime<Utc>) -> CoreResult<()> {
        let duration_ms = job
            .started_at
            .map(|s| now.signed_duration_since(s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let record = CompletionRecord {
            job_type: job.job_type.clone(),
            completed_at: now,
            duration_ms,
        };
        self.store
            .lpush(keys::STATS_COMPLETION_HISTORY, &serde_json::to_string(&record)?)
            .await?;
        self.store
            .ltrim(
                keys::STATS_COMPLETION_HISTORY,
                0,
                keys::COMPLETION_HISTORY_CAP - 1,
            )
            .await
    }

    async fn record_failure(&self, job: &Job, error: &str) -> CoreResult<()> {
        let record = FailureRecord {
            job_type: job.job_type.clone(),
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        self.store
            .lpush(keys::STATS_FAILURE_HISTORY, &serde_json::to_string(&record)?)
            .await?;
        self.store
            .ltrim(
                keys::STATS_FAILURE_HISTORY,
                0,
                keys::FAILURE_HISTORY_CAP - 1,
            )
            .await
    }

    /// Completion webhooks are fire-and-forget: one attempt, bounded timeout,
    /// failures logged and never retried.
    fn fire_callback(&self, job: &Job) {
        let Some(url) = job.callback_url.clone() else {
            return;
        };
        let client = self.http.clone();
        let payload = match serde_json::to_value(job) {
            Ok(v) => v,
            Err(e) => {
                warn!(job = %job.id, error = %e, "callback payload serialization failed");
                return;
            }
        };
        let job_id = job.id;
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .timeout(CALLBACK_TIMEOUT)
                .json(&payload)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    warn!(job = %job_id, url = %url, status = %resp.status(), "callback rejected")
                }
                Err(e) => warn!(job = %job_id, url = %url, error = %e, "callback failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_store::MemoryStore;

    fn queue() -> (JobQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(store.clone());
        (JobQueue::new(store.clone(), bus), store)
    }

    fn request(job_type: &str, priority: JobPriority) -> JobRequest {
        serde_json::from_value(serde_json::json!({
            "job_type": job_type,
            "priority": priority,
            "payload": {"k": "v"},
        }))
        .expect("request")
    }

    #[tokio::test]
    async fn test_submit_then_get_round_trip() {
        let (queue, store) = queue();
        let job = queue
            .submit(request("image_gen", JobPriority::Normal))
            .await
            .unwrap();

        let fetched = queue.get(job.id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Queued);
        assert_eq!(fetched.payload, serde_json::json!({"k": "v"}));
        assert_eq!(
            store.llen(&keys::queue_list(JobPriority::Normal)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_type() {
        let (queue, _) = queue();
        let err = queue
            .submit(request("  ", JobPriority::Normal))
            .await
            .expect_err("validation");
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let (queue, _) = queue();
        let err = queue.get(Uuid::new_v4()).await.expect_err("missing");
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_claim_strict_priority_order() {
        let (queue, _) = queue();
        let low = queue.submit(request("t", JobPriority::Low)).await.unwrap();
        let normal = queue
            .submit(request("t", JobPriority::Normal))
            .await
            .unwrap();
        let high = queue.submit(request("t", JobPriority::High)).await.unwrap();

        let c1 = queue.claim("w1", None, None).await.unwrap().unwrap();
        let c2 = queue.claim("w1", None, None).await.unwrap().unwrap();
        let c3 = queue.claim("w1", None, None).await.unwrap().unwrap();
        assert_eq!(c1.id, high.id);
        assert_eq!(c2.id, normal.id);
        assert_eq!(c3.id, low.id);
        assert!(queue.claim("w1", None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_sets_processing_state() {
        let (queue, store) = queue();
        let job = queue.submit(request("t", JobPriority::High)).await.unwrap();

        let claimed = queue.claim("w1", None, None).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.assigned_node.as_deref(), Some("w1"));
        assert!(claimed.started_at.is_some());
        assert!(store
            .sismember(keys::QUEUE_PROCESSING, &job.id.to_string())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_claim_pushes_back_incompatible_target() {
        let (queue, _) = queue();
        let mut req = request("t", JobPriority::Normal);
        req.target_cluster = Some("llm".to_string());
        let targeted = queue.submit(req).await.unwrap();
        let open = queue
            .submit(request("t", JobPriority::Normal))
            .await
            .unwrap();

        // Vision worker skips the llm-targeted job and gets the open one.
        let claimed = queue
            .claim("w1", Some("vision"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, open.id);
        assert_eq!(
            queue.get(targeted.id).await.unwrap().status,
            JobStatus::Queued
        );

        // The llm worker drains the targeted job.
        let claimed = queue.claim("w2", Some("llm"), None).await.unwrap().unwrap();
        assert_eq!(claimed.id, targeted.id);
    }

    #[tokio::test]
    async fn test_claim_respects_accepted_types() {
        let (queue, _) = queue();
        queue
            .submit(request("image_gen", JobPriority::Normal))
            .await
            .unwrap();

        let accepted = vec!["llm_inference".to_string()];
        assert!(queue
            .claim("w1", None, Some(&accepted))
            .await
            .unwrap()
            .is_none());

        let accepted = vec!["image_gen".to_string()];
        assert!(queue
            .claim("w1", None, Some(&accepted))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_complete_requires_ownership() {
        let (queue, _) = queue();
        let job = queue.submit(request("t", JobPriority::Normal)).await.unwrap();
        queue.claim("w1", None, None).await.unwrap().unwrap();

        let err = queue
            .complete(job.id, "w2", JobOutcome::Success(serde_json::json!({})))
            .await
            .expect_err("wrong worker");
        assert_eq!(err.status_code(), 409);
        // State unchanged
        let current = queue.get(job.id).await.unwrap();
        assert_eq!(current.status, JobStatus::Processing);
        assert_eq!(current.assigned_node.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_complete_success_accounting() {
        let (queue, store) = queue();
        let job = queue.submit(request("t", JobPriority::Normal)).await.unwrap();
        queue.claim("w1", None, None).await.unwrap().unwrap();

        let done = queue
            .complete(job.id, "w1", JobOutcome::Success(serde_json::json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100.0);
        assert!(!store
            .sismember(keys::QUEUE_PROCESSING, &job.id.to_string())
            .await
            .unwrap());
        assert_eq!(
            store.get(keys::STATS_COMPLETED).await.unwrap(),
            Some("1".to_string())
        );
        assert_eq!(
            store.llen(keys::STATS_COMPLETION_HISTORY).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_retry_until_dead() {
        let (queue, store) = queue();
        let mut req = request("flaky", JobPriority::Normal);
        req.max_retries = 2;
        let job = queue.submit(req).await.unwrap();

        // Attempt 1: fails, re-queued
        queue.claim("w1", None, None).await.unwrap().unwrap();
        let after = queue
            .complete(job.id, "w1", JobOutcome::Failure("boom".into()))
            .await
            .unwrap();
        assert_eq!(after.status, JobStatus::Queued);
        assert_eq!(after.retry_count, 1);

        // Attempt 2: fails again, retry budget exhausted
        queue.claim("w1", None, None).await.unwrap().unwrap();
        let after = queue
            .complete(job.id, "w1", JobOutcome::Failure("boom".into()))
            .await
            .unwrap();
        assert_eq!(after.status, JobStatus::Dead);
        assert_eq!(after.retry_count, 2);
        assert_eq!(
            store.get(keys::STATS_FAILED).await.unwrap(),
            Some("1".to_string())
        );
        assert_eq!(store.llen(keys::STATS_FAILURE_HISTORY).await.unwrap(), 1);
        // Nothing left to claim
        assert!(queue.claim("w1", None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_count_monotonic_and_operator_retry() {
        let (queue, _) = queue();
        let mut req = request("t", JobPriority::Low);
        req.max_retries = 1;
        let job = queue.submit(req).await.unwrap();

        queue.claim("w1", None, None).await.unwrap().unwrap();
        queue
            .complete(job.id, "w1", JobOutcome::Failure("x".into()))
            .await
            .unwrap();
        assert_eq!(queue.get(job.id).await.unwrap().status, JobStatus::Dead);

        let revived = queue.retry(job.id).await.unwrap();
        assert_eq!(revived.status, JobStatus::Queued);
        assert_eq!(revived.retry_count, 0);
        assert!(revived.error.is_none());
        assert!(queue.claim("w1", None, None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_rejected_for_non_failed() {
        let (queue, _) = queue();
        let job = queue.submit(request("t", JobPriority::Normal)).await.unwrap();
        let err = queue.retry(job.id).await.expect_err("still queued");
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let (queue, store) = queue();
        let job = queue.submit(request("t", JobPriority::High)).await.unwrap();

        let cancelled = queue.cancel(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(
            store.llen(&keys::queue_list(JobPriority::High)).await.unwrap(),
            0
        );
        assert!(queue.claim("w1", None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_idempotent_and_terminal_conflict() {
        let (queue, _) = queue();
        let job = queue.submit(request("t", JobPriority::Normal)).await.unwrap();
        queue.cancel(job.id).await.unwrap();

        // Second cancel: no-op returning the record
        let again = queue.cancel(job.id).await.unwrap();
        assert_eq!(again.status, JobStatus::Cancelled);

        // Completed job: conflict
        let job2 = queue.submit(request("t", JobPriority::Normal)).await.unwrap();
        queue.claim("w1", None, None).await.unwrap().unwrap();
        queue
            .complete(job2.id, "w1", JobOutcome::Success(serde_json::json!({})))
            .await
            .unwrap();
        let err = queue.cancel(job2.id).await.expect_err("terminal");
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_update_progress_clamped_and_owned() {
        let (queue, _) = queue();
        let job = queue.submit(request("t", JobPriority::Normal)).await.unwrap();
        queue.claim("w1", None, None).await.unwrap().unwrap();

        let updated = queue
            .update_progress(job.id, "w1", 150.0, Some("step 3/3".into()))
            .await
            .unwrap();
        assert_eq!(updated.progress, 100.0);
        assert_eq!(updated.progress_detail.as_deref(), Some("step 3/3"));

        let err = queue
            .update_progress(job.id, "w2", 10.0, None)
            .await
            .expect_err("wrong worker");
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_job_in_exactly_one_place() {
        let (queue, store) = queue();
        let job = queue.submit(request("t", JobPriority::Normal)).await.unwrap();
        let id_str = job.id.to_string();

        let queued_len = store.llen(&keys::queue_list(JobPriority::Normal)).await.unwrap();
        let in_processing = store
            .sismember(keys::QUEUE_PROCESSING, &id_str)
            .await
            .unwrap();
        assert_eq!((queued_len, in_processing), (1, false));

        queue.claim("w1", None, None).await.unwrap().unwrap();
        let queued_len = store.llen(&keys::queue_list(JobPriority::Normal)).await.unwrap();
        let in_processing = store
            .sismember(keys::QUEUE_PROCESSING, &id_str)
            .await
            .unwrap();
        assert_eq!((queued_len, in_processing), (0, true));

        queue
            .complete(job.id, "w1", JobOutcome::Success(serde_json::json!({})))
            .await
            .unwrap();
        let queued_len = store.llen(&keys::queue_list(JobPriority::Normal)).await.unwrap();
        let in_processing = store
            .sismember(keys::QUEUE_PROCESSING, &id_str)
            .await
            .unwrap();
        assert_eq!((queued_len, in_processing), (0, false));
        assert!(queue.get(job.id).await.unwrap().status.is_terminal());
    }

    #[tokio::test]
    async fn test_stats_depths_and_rate() {
        let (queue, _) = queue();
        queue.submit(request("t", JobPriority::High)).await.unwrap();
        queue.submit(request("t", JobPriority::High)).await.unwrap();
        queue.submit(request("t", JobPriority::Low)).await.unwrap();

        let claimed = queue.claim("w1", None, None).await.unwrap().unwrap();
        queue
            .complete(claimed.id, "w1", JobOutcome::Success(serde_json::json!({})))
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.depths.high, 1);
        assert_eq!(stats.depths.low, 1);
        assert_eq!(stats.total_queued, 3);
        assert_eq!(stats.total_completed, 1);
        assert!(stats.processing_rate_per_min > 0.0);
    }

    #[tokio::test]
    async fn test_targeted_stuck_surfaced() {
        let (queue, store) = queue();
        let mut req = request("t", JobPriority::Normal);
        req.target_node = Some("ghost-node".to_string());
        queue.submit(req).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.targeted_stuck, 1);

        store.sadd(keys::NODES_ACTIVE, "ghost-node").await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.targeted_stuck, 0);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (queue, _) = queue();
        queue
            .submit(request("image_gen", JobPriority::Normal))
            .await
            .unwrap();
        queue
            .submit(request("llm_inference", JobPriority::Normal))
            .await
            .unwrap();

        let all = queue.list(&JobFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let images = queue
            .list(&JobFilter {
                job_type: Some("image_gen".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(images.len(), 1);

        let queued = queue
            .list(&JobFilter {
                status: Some(JobStatus::Queued),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(queued.len(), 2);
    }
}
