//! End-to-end flows across the control plane crates:
//! - priority drain and target filtering through the pull queue
//! - retry-until-dead accounting
//! - sticky model routing and forced swaps in the vision scheduler
//! - doctor disk remediation with cooldown suppression
//! - registry liveness feeding the scaler

use async_trait::async_trait;
use chrono::Utc;
use muster_doctor::{Doctor, DoctorConfig};
use muster_events::EventBus;
use muster_proto::{
    ActionResult, CoreError, CoreResult, JobPriority, JobRequest, JobStatus, NodeHeartbeat,
    NodeStatus, Problem, ScaleAction, SystemStat, VisionNode,
};
use muster_queue::{JobOutcome, JobQueue};
use muster_registry::NodeRegistry;
use muster_scaler::AutoScaler;
use muster_scheduler::{Scheduler, SchedulerTiming, TickOutcome, VisionPool, WorkerApi};
use muster_store::{MemoryStore, StateStore, keys};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn store_and_bus() -> (Arc<MemoryStore>, EventBus) {
    let store = Arc::new(MemoryStore::new());
    let bus = EventBus::new(store.clone());
    (store, bus)
}

fn job_request(job_type: &str, priority: JobPriority) -> JobRequest {
    serde_json::from_value(serde_json::json!({
        "job_type": job_type,
        "priority": priority,
        "payload": {"prompt": "a lighthouse at dusk"},
    }))
    .expect("request")
}

fn vision_node(id: &str, model: Option<&str>, util: u8) -> VisionNode {
    VisionNode {
        node_id: id.to_string(),
        hostname: id.to_string(),
        ip: "10.0.0.5".to_string(),
        port: 8080,
        current_model: model.map(str::to_string),
        status: NodeStatus::Online,
        gpu_util: util,
        last_heartbeat: Utc::now(),
        current_job_id: None,
    }
}

fn heartbeat(node_id: &str, disk_pct: f32) -> NodeHeartbeat {
    NodeHeartbeat {
        node_id: node_id.to_string(),
        timestamp: Utc::now(),
        ip: Some("10.0.0.5".to_string()),
        cluster: Some("vision".to_string()),
        status: Some(NodeStatus::Online),
        system: SystemStat {
            cpu_pct: 15.0,
            mem_pct: 40.0,
            disk_pct,
            disk_free_gb: 80.0,
            uptime_s: 7200,
            load_avg: [0.4, 0.3, 0.2],
        },
        gpus: vec![],
        power: None,
        activity: None,
        containers: vec![],
    }
}

/// Worker double that completes generations and swaps by emulating the
/// worker's next heartbeat.
struct FakeWorker {
    pool: VisionPool,
    generated_on: Mutex<Vec<(String, String)>>,
}

impl FakeWorker {
    fn new(pool: VisionPool) -> Self {
        Self {
            pool,
            generated_on: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl WorkerApi for FakeWorker {
    async fn switch_model(&self, node: &VisionNode, model: &str) -> CoreResult<()> {
        let pool = self.pool.clone();
        let node_id = node.node_id.clone();
        let model = model.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Ok(Some(mut n)) = pool.get(&node_id).await {
                n.current_model = Some(model);
                n.status = NodeStatus::Online;
                n.last_heartbeat = Utc::now();
                let _ = pool.save(&n).await;
            }
        });
        Ok(())
    }

    async fn generate(
        &self,
        node: &VisionNode,
        _request: &serde_json::Value,
    ) -> CoreResult<serde_json::Value> {
        let model = node.current_model.clone().unwrap_or_default();
        self.generated_on
            .lock()
            .unwrap()
            .push((node.node_id.clone(), model));
        Ok(serde_json::json!({"image": "ok"}))
    }

    async fn cancel(&self, _node: &VisionNode, _job_id: &str) -> CoreResult<()> {
        Ok(())
    }
}

fn fast_timing() -> SchedulerTiming {
    SchedulerTiming {
        idle_sleep: Duration::from_millis(10),
        no_worker_backoff: Duration::from_millis(10),
        swap_poll: Duration::from_millis(10),
        swap_timeout: Duration::from_millis(300),
    }
}

async fn wait_terminal(scheduler: &Scheduler, id: uuid::Uuid) -> muster_proto::VisionJob {
    for _ in 0..100 {
        let job = scheduler.job(id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("vision job {id} never finished");
}

// ─── Scenario 1: priority drain ───────────────────────────────────────────────

#[tokio::test]
async fn test_priority_drain_order() {
    let (store, bus) = store_and_bus();
    let queue = JobQueue::new(store, bus);

    let j1 = queue
        .submit(job_request("render", JobPriority::Low))
        .await
        .unwrap();
    let j2 = queue
        .submit(job_request("render", JobPriority::Normal))
        .await
        .unwrap();
    let j3 = queue
        .submit(job_request("render", JobPriority::High))
        .await
        .unwrap();

    let claimed: Vec<uuid::Uuid> = {
        let mut ids = Vec::new();
        while let Some(job) = queue.claim("w", None, None).await.unwrap() {
            ids.push(job.id);
        }
        ids
    };
    assert_eq!(claimed, vec![j3.id, j2.id, j1.id]);
}

// ─── Scenario 2: target filtering ─────────────────────────────────────────────

#[tokio::test]
async fn test_target_filtering_across_clusters() {
    let (store, bus) = store_and_bus();
    let queue = JobQueue::new(store, bus);

    let mut targeted = job_request("infer", JobPriority::Normal);
    targeted.target_cluster = Some("llm".to_string());
    let j1 = queue.submit(targeted).await.unwrap();
    let j2 = queue
        .submit(job_request("infer", JobPriority::Normal))
        .await
        .unwrap();

    // Vision worker: gets only the untargeted job.
    let got = queue
        .claim("w1", Some("vision"), None)
        .await
        .unwrap()
        .expect("job for w1");
    assert_eq!(got.id, j2.id);
    assert_eq!(queue.get(j1.id).await.unwrap().status, JobStatus::Queued);

    // LLM worker: drains the targeted job.
    let got = queue
        .claim("w2", Some("llm"), None)
        .await
        .unwrap()
        .expect("job for w2");
    assert_eq!(got.id, j1.id);
}

// ─── Scenario 3: retry until dead ─────────────────────────────────────────────

#[tokio::test]
async fn test_retry_until_dead_state_sequence() {
    let (store, bus) = store_and_bus();
    let queue = JobQueue::new(store.clone(), bus);

    let mut request = job_request("flaky", JobPriority::Normal);
    request.max_retries = 3;
    let job = queue.submit(request).await.unwrap();

    let mut observed = vec![queue.get(job.id).await.unwrap().status];
    for round in 1..=3 {
        let claimed = queue.claim("w", None, None).await.unwrap().expect("claim");
        observed.push(claimed.status);
        let after = queue
            .complete(job.id, "w", JobOutcome::Failure(format!("attempt {round}")))
            .await
            .unwrap();
        observed.push(after.status);
    }

    assert_eq!(
        observed,
        vec![
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Dead,
        ]
    );
    // Dead-letter accounting fires exactly once.
    assert_eq!(
        store.get(keys::STATS_FAILED).await.unwrap(),
        Some("1".to_string())
    );
}

// ─── Scenario 4: sticky model routing ────────────────────────────────────────

#[tokio::test]
async fn test_sticky_routing_avoids_swaps() {
    let (store, bus) = store_and_bus();
    let pool = VisionPool::new(store.clone());
    let worker = Arc::new(FakeWorker::new(pool.clone()));
    let scheduler =
        Scheduler::new(store, bus, worker.clone()).with_timing(fast_timing());

    scheduler
        .pool()
        .save(&vision_node("n1", Some("model-a"), 5))
        .await
        .unwrap();
    scheduler
        .pool()
        .save(&vision_node("n2", Some("model-b"), 5))
        .await
        .unwrap();

    let to_b = scheduler
        .submit(serde_json::json!({"prompt": "x"}), "model-b".into(), JobPriority::Normal)
        .await
        .unwrap();
    assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Dispatched);
    let done = wait_terminal(&scheduler, to_b.id).await;
    assert_eq!(done.assigned_node.as_deref(), Some("n2"));

    let to_a = scheduler
        .submit(serde_json::json!({"prompt": "y"}), "model-a".into(), JobPriority::Normal)
        .await
        .unwrap();
    assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Dispatched);
    let done = wait_terminal(&scheduler, to_a.id).await;
    assert_eq!(done.assigned_node.as_deref(), Some("n1"));

    // Each generation ran on the worker that already held the model.
    let generated = worker.generated_on.lock().unwrap().clone();
    assert_eq!(
        generated,
        vec![
            ("n2".to_string(), "model-b".to_string()),
            ("n1".to_string(), "model-a".to_string()),
        ]
    );
}

// ─── Scenario 5: forced swap ──────────────────────────────────────────────────

#[tokio::test]
async fn test_forced_swap_on_single_worker() {
    let (store, bus) = store_and_bus();
    let pool = VisionPool::new(store.clone());
    let worker = Arc::new(FakeWorker::new(pool.clone()));
    let scheduler =
        Scheduler::new(store, bus, worker.clone()).with_timing(fast_timing());

    scheduler
        .pool()
        .save(&vision_node("n1", Some("model-a"), 5))
        .await
        .unwrap();

    let job = scheduler
        .submit(serde_json::json!({"prompt": "x"}), "model-b".into(), JobPriority::Normal)
        .await
        .unwrap();
    assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Dispatched);

    let done = wait_terminal(&scheduler, job.id).await;
    assert_eq!(done.status, muster_proto::VisionJobStatus::Completed);
    assert_eq!(done.assigned_node.as_deref(), Some("n1"));

    // The generation ran only after the swap landed.
    let generated = worker.generated_on.lock().unwrap().clone();
    assert_eq!(generated, vec![("n1".to_string(), "model-b".to_string())]);
}

// ─── Scenario 6: doctor disk remediation with cooldown ───────────────────────

struct SucceedingRunner {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl muster_doctor::ActionRunner for SucceedingRunner {
    async fn execute(
        &self,
        action: &str,
        node_id: Option<&str>,
        _params: serde_json::Value,
        _credential_id: Option<&str>,
    ) -> ActionResult {
        self.calls.lock().unwrap().push(action.to_string());
        ActionResult {
            success: true,
            action: action.to_string(),
            node_id: node_id.map(str::to_string),
            message: "cleaned".to_string(),
            details: serde_json::json!({"freed_gb": 12}),
            executed_at: Utc::now(),
            duration_ms: 40,
        }
    }
}

struct DownOracle;

#[async_trait]
impl muster_doctor::DiagnosisOracle for DownOracle {
    async fn diagnose(
        &self,
        _problem: &Problem,
        _context: &muster_doctor::DiagnosisContext,
    ) -> CoreResult<muster_doctor::Diagnosis> {
        Err(CoreError::Transient("llm offline".to_string()))
    }
}

#[tokio::test]
async fn test_doctor_disk_remediation_and_cooldown() {
    let (store, bus) = store_and_bus();
    let registry = NodeRegistry::new(store.clone(), bus.clone());
    registry.heartbeat(heartbeat("agx-01", 90.0)).await.unwrap();

    let runner = Arc::new(SucceedingRunner {
        calls: Mutex::new(Vec::new()),
    });
    let doctor = Doctor::new(
        store.clone(),
        bus,
        runner.clone(),
        Arc::new(DownOracle),
        DoctorConfig::default(),
    );

    // Cycle 1: high_disk detected, disk_cleanup executed, history written.
    let report = doctor.run_cycle().await.unwrap();
    assert_eq!(report.problems_found, 1);
    assert_eq!(report.actions_executed, 1);
    assert_eq!(runner.calls.lock().unwrap().as_slice(), ["disk_cleanup"]);

    let history = doctor.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].result.success);

    // Cycle 2 shortly after: problem persists, cooldown suppresses action.
    let report = doctor.run_cycle().await.unwrap();
    assert_eq!(report.problems_found, 1);
    assert_eq!(report.actions_executed, 0);
    assert_eq!(report.skipped_cooldown, 1);
    assert_eq!(runner.calls.lock().unwrap().len(), 1);
}

// ─── Registry + scaler flow ───────────────────────────────────────────────────

#[tokio::test]
async fn test_register_heartbeat_list_round_trip() {
    let (store, bus) = store_and_bus();
    let registry = NodeRegistry::new(store, bus);

    let registration: muster_proto::NodeRegistration =
        serde_json::from_value(serde_json::json!({
            "node_id": "agx-01",
            "hostname": "agx-01",
            "ip": "10.0.0.5",
            "cluster": "vision",
            "capabilities": ["gpu", "docker", "cuda"],
        }))
        .expect("registration");

    registry.register(registration.clone()).await.unwrap();
    registry.register(registration).await.unwrap(); // idempotent
    registry.heartbeat(heartbeat("agx-01", 40.0)).await.unwrap();

    let views = registry.list(Some("vision"), None).await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].status, NodeStatus::Online);
    assert_eq!(
        views[0]
            .registration
            .as_ref()
            .unwrap()
            .registration
            .capabilities,
        vec!["gpu", "docker", "cuda"]
    );
}

#[tokio::test]
async fn test_heartbeats_feed_scaler_decision() {
    let (store, bus) = store_and_bus();
    let registry = NodeRegistry::new(store.clone(), bus.clone());
    let queue = JobQueue::new(store.clone(), bus.clone());
    let scaler = AutoScaler::new(store.clone(), bus);

    // Two saturated nodes and a deep queue.
    for id in ["agx-01", "agx-02"] {
        let mut hb = heartbeat(id, 50.0);
        hb.gpus.push(muster_proto::GpuStat {
            index: 0,
            name: "Orin".to_string(),
            mem_total_mb: 32768,
            mem_used_mb: 30000,
            util_pct: 95.0,
            temp_c: 70.0,
            power_w: 55.0,
        });
        registry.heartbeat(hb).await.unwrap();
    }
    for _ in 0..15 {
        queue
            .submit(job_request("render", JobPriority::Normal))
            .await
            .unwrap();
    }

    let decision = scaler.evaluate().await.unwrap();
    assert_eq!(decision.action, ScaleAction::ScaleUp);
    assert!(decision.recommended_nodes > 2);
}

// ─── Submit → get payload fidelity ────────────────────────────────────────────

#[tokio::test]
async fn test_submit_get_payload_verbatim() {
    let (store, bus) = store_and_bus();
    let queue = JobQueue::new(store, bus);

    let payload = serde_json::json!({
        "workflow": {"steps": [1, 2, 3]},
        "prompt": "night market, rain",
        "seed": 42,
    });
    let mut request = job_request("image_gen", JobPriority::High);
    request.payload = payload.clone();

    let submitted = queue.submit(request).await.unwrap();
    let fetched = queue.get(submitted.id).await.unwrap();
    assert_eq!(fetched.payload, payload);
    assert_eq!(fetched.job_type, "image_gen");
    assert_eq!(fetched.priority, JobPriority::High);
}
