//! Protocol types for the Muster fleet control plane.
//!
//! Defines the records exchanged between worker agents, the head process,
//! and operator clients: node heartbeats, jobs, detected problems,
//! remediation results, scaling decisions, and push commands.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Error taxonomy shared by every core component.
///
/// Request handlers map these onto HTTP statuses; poller loops log the
/// transient ones and continue with the next cycle.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// True for failures worth retrying on the next poll cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The HTTP status an edge handler should surface for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Validation(_) | Self::Json(_) => 400,
            Self::Transient(_) => 503,
            Self::Fatal(_) => 500,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

// ─── Node status & stats ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Busy,
    Switching,
    #[default]
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Busy => write!(f, "busy"),
            Self::Switching => write!(f, "switching"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Per-GPU sample carried in a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuStat {
    pub index: u32,
    pub name: String,
    pub mem_total_mb: u64,
    pub mem_used_mb: u64,
    pub util_pct: f32,
    pub temp_c: f32,
    pub power_w: f32,
}

/// Host-level resource sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStat {
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub disk_pct: f32,
    pub disk_free_gb: f32,
    pub uptime_s: u64,
    pub load_avg: [f32; 3],
}

/// Power draw breakdown reported by nodes with INA sensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerStat {
    pub total_w: f32,
    pub gpu_w: f32,
    pub cpu_w: f32,
}

/// One retained power reading in a node's history ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerSample {
    pub timestamp: DateTime<Utc>,
    pub total_w: f32,
    pub gpu_w: f32,
    pub cpu_w: f32,
}

/// What the node believes it is doing right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityStat {
    pub status: String,
    pub containers: u32,
}

// ─── Registration & heartbeat payloads ───────────────────────────────────────

fn default_platform() -> String {
    "linux".to_string()
}

/// Registration body sent once when a worker agent starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: String,
    pub hostname: String,
    pub ip: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub gpu_memory_mb: Option<u64>,
    #[serde(default)]
    pub gpu_count: Option<u32>,
    #[serde(default)]
    pub agent_port: Option<u16>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Full node snapshot POSTed every heartbeat interval.
///
/// Containers are opaque to the control plane; they are stored and surfaced
/// verbatim for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub status: Option<NodeStatus>,
    pub system: SystemStat,
    #[serde(default)]
    pub gpus: Vec<GpuStat>,
    #[serde(default)]
    pub power: Option<PowerStat>,
    #[serde(default)]
    pub activity: Option<ActivityStat>,
    #[serde(default)]
    pub containers: Vec<serde_json::Value>,
}

impl NodeHeartbeat {
    /// Mean GPU utilization across all reported GPUs, 0 when none.
    pub fn avg_gpu_util(&self) -> f32 {
        if self.gpus.is_empty() {
            return 0.0;
        }
        self.gpus.iter().map(|g| g.util_pct).sum::<f32>() / self.gpus.len() as f32
    }
}

// ─── Vision nodes ─────────────────────────────────────────────────────────────

/// Liveness window for vision workers — they heartbeat every 10 s.
pub const VISION_LIVENESS_SECS: i64 = 30;

/// Heartbeat body from an image-generation worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionHeartbeat {
    pub node_id: String,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub current_model: Option<String>,
    pub gpu_util: u8,
    pub status: NodeStatus,
}

/// Scheduler-side view of an image-generation worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionNode {
    pub node_id: String,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub current_model: Option<String>,
    pub status: NodeStatus,
    pub gpu_util: u8,
    pub last_heartbeat: DateTime<Utc>,
    pub current_job_id: Option<String>,
}

impl VisionNode {
    /// Base URL of the worker's inference server.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    /// Heartbeat freshness within the 30 s vision liveness window.
    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_heartbeat) < Duration::seconds(VISION_LIVENESS_SECS)
    }

    /// Eligible for new work: online status, fresh heartbeat, no job held.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.status == NodeStatus::Online && self.current_job_id.is_none() && self.is_online(now)
    }
}

impl From<VisionHeartbeat> for VisionNode {
    fn from(hb: VisionHeartbeat) -> Self {
        Self {
            node_id: hb.node_id,
            hostname: hb.hostname,
            ip: hb.ip,
            port: hb.port,
            current_model: hb.current_model,
            status: hb.status,
            gpu_util: hb.gpu_util,
            last_heartbeat: Utc::now(),
            current_job_id: None,
        }
    }
}

// ─── Jobs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Claim order: strict priority, high drains first.
    pub const CLAIM_ORDER: [JobPriority; 3] =
        [JobPriority::High, JobPriority::Normal, JobPriority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Weight used for the scaler's weighted queue depth.
    pub fn weight(&self) -> u64 {
        match self {
            Self::High => 3,
            Self::Normal => 2,
            Self::Low => 1,
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Dead,
    Cancelled,
}

impl JobStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Dead | Self::Cancelled
        )
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_seconds() -> u64 {
    3600
}

/// Job submission body (`POST /queue/jobs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_type: String,
    #[serde(default)]
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub target_cluster: Option<String>,
    #[serde(default)]
    pub target_node: Option<String>,
    #[serde(default)]
    pub target_model: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// Full job record as stored under `job:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    pub target_cluster: Option<String>,
    pub target_node: Option<String>,
    pub target_model: Option<String>,
    pub status: JobStatus,
    pub max_retries: u32,
    pub retry_count: u32,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_node: Option<String>,
    pub progress: f32,
    pub progress_detail: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub callback_url: Option<String>,
}

impl Job {
    /// Build a fresh queued job from a submission request.
    pub fn from_request(req: JobRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: req.job_type,
            priority: req.priority,
            payload: req.payload,
            target_cluster: req.target_cluster,
            target_node: req.target_node,
            target_model: req.target_model,
            status: JobStatus::Queued,
            max_retries: req.max_retries,
            retry_count: 0,
            timeout_seconds: req.timeout_seconds,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_node: None,
            progress: 0.0,
            progress_detail: None,
            result: None,
            error: None,
            callback_url: req.callback_url,
        }
    }

    /// A worker may take this job iff the job's targeting constraints allow it.
    pub fn compatible_with(
        &self,
        worker_id: &str,
        worker_cluster: Option<&str>,
        accepted_types: Option<&[String]>,
    ) -> bool {
        if let Some(target) = &self.target_node
            && target != worker_id
        {
            return false;
        }
        if let Some(target) = &self.target_cluster
            && worker_cluster != Some(target.as_str())
        {
            return false;
        }
        if let Some(types) = accepted_types
            && !types.iter().any(|t| t == &self.job_type)
        {
            return false;
        }
        true
    }
}

// ─── Vision jobs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisionJobStatus {
    Pending,
    Routing,
    ModelSwitching,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl VisionJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// An image-generation job routed by the model-aware scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionJob {
    pub id: Uuid,
    pub request: serde_json::Value,
    pub target_model: String,
    pub priority: JobPriority,
    pub status: VisionJobStatus,
    pub assigned_node: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl VisionJob {
    pub fn new(request: serde_json::Value, target_model: String, priority: JobPriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            target_model,
            priority,
            status: VisionJobStatus::Pending,
            assigned_node: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

// ─── Problems & remediation ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemType {
    OfflineNode,
    HighDisk,
    CriticalDisk,
    HighMemory,
    DockerDown,
    AgentDown,
    S3MountMissing,
    SwarmUnhealthy,
    JobFailures,
    HighGpuTemp,
}

impl std::fmt::Display for ProblemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OfflineNode => "offline_node",
            Self::HighDisk => "high_disk",
            Self::CriticalDisk => "critical_disk",
            Self::HighMemory => "high_memory",
            Self::DockerDown => "docker_down",
            Self::AgentDown => "agent_down",
            Self::S3MountMissing => "s3_mount_missing",
            Self::SwarmUnhealthy => "swarm_unhealthy",
            Self::JobFailures => "job_failures",
            Self::HighGpuTemp => "high_gpu_temp",
        };
        f.write_str(s)
    }
}

/// A detected fleet problem. The problem set is rebuilt wholesale each
/// doctor cycle; resolved problems simply stop appearing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    #[serde(rename = "type")]
    pub problem_type: ProblemType,
    pub severity: Severity,
    pub node_id: Option<String>,
    pub title: String,
    pub description: String,
    pub details: serde_json::Value,
    pub detected_at: DateTime<Utc>,
    pub auto_fixable: bool,
    pub risk_level: RiskLevel,
}

/// Outcome of one executed remediation action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub action: String,
    pub node_id: Option<String>,
    pub message: String,
    pub details: serde_json::Value,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

// ─── Events ───────────────────────────────────────────────────────────────────

/// Typed envelope published on every pub/sub channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

// ─── Push commands ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Shell,
    DockerRun,
    DockerStop,
    DockerLogs,
    Ping,
}

/// A command pushed to a worker over its `commands:<node_id>` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCommand {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub params: serde_json::Value,
    pub issued_by: String,
}

impl NodeCommand {
    pub fn new(kind: CommandKind, params: serde_json::Value, issued_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            params,
            issued_by: issued_by.into(),
        }
    }
}

/// Result published by the worker on `command_results:<cmd_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCommandResult {
    pub command_id: String,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

// ─── Scaling ──────────────────────────────────────────────────────────────────

/// Auto-scaler thresholds and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    pub enabled: bool,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub target_queue_depth: u64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub cooldown_seconds: u64,
    pub check_interval_seconds: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_nodes: 1,
            max_nodes: 16,
            target_queue_depth: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            cooldown_seconds: 300,
            check_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    #[default]
    None,
    ScaleUp,
    ScaleDown,
}

/// Persistent scaler state under `scaling:state`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScalerState {
    pub current_scale: u32,
    pub recommended_scale: u32,
    pub last_action: ScaleAction,
    pub last_scale_time: Option<DateTime<Utc>>,
    pub last_reason: Option<String>,
    pub last_evaluation: Option<DateTime<Utc>>,
    pub queue_depth: u64,
    pub avg_gpu_utilization: f64,
}

/// One scaler evaluation, appended to `scaling:history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub action: ScaleAction,
    pub reason: Option<String>,
    pub current_nodes: u32,
    pub recommended_nodes: u32,
    pub queue_depth: u64,
    pub avg_gpu_utilization: f64,
    pub idle_nodes: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Per-priority queue depths, as read by the scaler and the stats endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct QueueDepths {
    pub high: u64,
    pub normal: u64,
    pub low: u64,
}

impl QueueDepths {
    pub fn total(&self) -> u64 {
        self.high + self.normal + self.low
    }

    /// High-priority backlog weighs heavier in scale-up decisions.
    pub fn weighted(&self) -> u64 {
        self.high * JobPriority::High.weight()
            + self.normal * JobPriority::Normal.weight()
            + self.low * JobPriority::Low.weight()
    }
}

// ─── Validation ───────────────────────────────────────────────────────────────

/// Validate a node ID: non-empty, bounded, hostname-safe characters.
pub fn validate_node_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Clamp a reported progress value into the [0, 100] contract.
pub fn clamp_progress(progress: f32) -> f32 {
    progress.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_node_id() {
        assert!(validate_node_id("agx-07"));
        assert!(validate_node_id("worker_3.local"));
        assert!(!validate_node_id(""));
        assert!(!validate_node_id("bad id with spaces"));
        assert!(!validate_node_id(&"x".repeat(129)));
    }

    #[test]
    fn test_clamp_progress() {
        assert_eq!(clamp_progress(-5.0), 0.0);
        assert_eq!(clamp_progress(42.5), 42.5);
        assert_eq!(clamp_progress(180.0), 100.0);
    }

    #[test]
    fn test_priority_claim_order() {
        assert_eq!(
            JobPriority::CLAIM_ORDER,
            [JobPriority::High, JobPriority::Normal, JobPriority::Low]
        );
        assert_eq!(JobPriority::High.as_str(), "high");
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Dead.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_job_from_request_defaults() {
        let req: JobRequest = serde_json::from_value(serde_json::json!({
            "job_type": "image_gen",
            "payload": {"prompt": "a lighthouse"}
        }))
        .expect("deserialize");
        assert_eq!(req.priority, JobPriority::Normal);
        assert_eq!(req.max_retries, 3);
        assert_eq!(req.timeout_seconds, 3600);

        let job = Job::from_request(req);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.progress, 0.0);
    }

    #[test]
    fn test_job_compatibility_untargeted() {
        let job = Job::from_request(
            serde_json::from_value(serde_json::json!({
                "job_type": "llm_inference",
                "payload": {}
            }))
            .expect("deserialize"),
        );
        assert!(job.compatible_with("any-worker", None, None));
        assert!(job.compatible_with("any-worker", Some("llm"), None));
    }

    #[test]
    fn test_job_compatibility_target_node() {
        let mut job = Job::from_request(
            serde_json::from_value(serde_json::json!({
                "job_type": "image_gen",
                "payload": {}
            }))
            .expect("deserialize"),
        );
        job.target_node = Some("agx-01".to_string());
        assert!(job.compatible_with("agx-01", None, None));
        assert!(!job.compatible_with("agx-02", None, None));
    }

    #[test]
    fn test_job_compatibility_target_cluster_and_type() {
        let mut job = Job::from_request(
            serde_json::from_value(serde_json::json!({
                "job_type": "image_gen",
                "payload": {}
            }))
            .expect("deserialize"),
        );
        job.target_cluster = Some("vision".to_string());
        assert!(!job.compatible_with("w1", None, None));
        assert!(!job.compatible_with("w1", Some("llm"), None));
        assert!(job.compatible_with("w1", Some("vision"), None));

        let accepted = vec!["llm_inference".to_string()];
        assert!(!job.compatible_with("w1", Some("vision"), Some(&accepted)));
    }

    #[test]
    fn test_vision_node_availability() {
        let now = Utc::now();
        let mut node = VisionNode {
            node_id: "agx-01".to_string(),
            hostname: "agx-01".to_string(),
            ip: "10.0.0.11".to_string(),
            port: 8080,
            current_model: Some("sdxl-base".to_string()),
            status: NodeStatus::Online,
            gpu_util: 5,
            last_heartbeat: now,
            current_job_id: None,
        };
        assert!(node.is_available(now));

        node.current_job_id = Some("job-1".to_string());
        assert!(!node.is_available(now));

        node.current_job_id = None;
        node.last_heartbeat = now - Duration::seconds(VISION_LIVENESS_SECS + 1);
        assert!(!node.is_online(now));
        assert!(!node.is_available(now));
    }

    #[test]
    fn test_queue_depths_weighted() {
        let d = QueueDepths {
            high: 2,
            normal: 3,
            low: 4,
        };
        assert_eq!(d.total(), 9);
        assert_eq!(d.weighted(), 2 * 3 + 3 * 2 + 4);
    }

    #[test]
    fn test_scaling_config_defaults() {
        let cfg = ScalingConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.min_nodes, 1);
        assert_eq!(cfg.max_nodes, 16);
        assert_eq!(cfg.target_queue_depth, 10);
        assert_eq!(cfg.cooldown_seconds, 300);
    }

    #[test]
    fn test_problem_type_display() {
        assert_eq!(ProblemType::HighDisk.to_string(), "high_disk");
        assert_eq!(ProblemType::S3MountMissing.to_string(), "s3_mount_missing");
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(CoreError::NotFound("x".into()).status_code(), 404);
        assert_eq!(CoreError::Conflict("x".into()).status_code(), 409);
        assert_eq!(CoreError::Validation("x".into()).status_code(), 400);
        assert_eq!(CoreError::Transient("x".into()).status_code(), 503);
        assert!(CoreError::Transient("x".into()).is_transient());
    }

    #[test]
    fn test_heartbeat_serialization_round_trip() {
        let hb = NodeHeartbeat {
            node_id: "agx-03".to_string(),
            timestamp: Utc::now(),
            ip: Some("10.0.0.13".to_string()),
            cluster: Some("vision".to_string()),
            status: Some(NodeStatus::Online),
            system: SystemStat {
                cpu_pct: 22.5,
                mem_pct: 48.0,
                disk_pct: 61.2,
                disk_free_gb: 120.0,
                uptime_s: 86400,
                load_avg: [0.5, 0.4, 0.3],
            },
            gpus: vec![GpuStat {
                index: 0,
                name: "Orin".to_string(),
                mem_total_mb: 32768,
                mem_used_mb: 8100,
                util_pct: 37.0,
                temp_c: 55.0,
                power_w: 28.0,
            }],
            power: Some(PowerStat {
                total_w: 41.0,
                gpu_w: 28.0,
                cpu_w: 9.0,
            }),
            activity: Some(ActivityStat {
                status: "computing".to_string(),
                containers: 2,
            }),
            containers: vec![],
        };

        let json = serde_json::to_string(&hb).expect("serialize");
        let back: NodeHeartbeat = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.node_id, "agx-03");
        assert_eq!(back.gpus.len(), 1);
        assert_eq!(back.avg_gpu_util(), 37.0);
    }

    #[test]
    fn test_event_envelope_wire_shape() {
        let env = EventEnvelope::new("problem_detected", serde_json::json!({"node_id": "agx-1"}));
        let v = serde_json::to_value(&env).expect("serialize");
        assert_eq!(v["type"], "problem_detected");
        assert!(v["timestamp"].is_string());
    }
}
