//! The normative key and channel schema.
//!
//! Every store key used anywhere in the control plane is built here, so the
//! layout can be audited in one place.

use muster_proto::JobPriority;
use std::time::Duration;
use uuid::Uuid;

// ─── TTLs and caps ────────────────────────────────────────────────────────────

/// Generic node heartbeat TTL. Wide enough to survive a reboot.
pub const HEARTBEAT_TTL: Duration = Duration::from_secs(120);

/// Vision worker heartbeat TTL. Vision workers report every 10 s.
pub const VISION_HEARTBEAT_TTL: Duration = Duration::from_secs(30);

/// Job records are kept a week, then expire.
pub const JOB_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

pub const POWER_HISTORY_CAP: i64 = 100;
pub const METRIC_SAMPLES_CAP: i64 = 3600;
pub const COMPLETION_HISTORY_CAP: i64 = 300;
pub const FAILURE_HISTORY_CAP: i64 = 50;
pub const DOCTOR_HISTORY_CAP: i64 = 100;
pub const SCALING_HISTORY_CAP: i64 = 100;

// ─── Node keys ────────────────────────────────────────────────────────────────

pub const NODES_ACTIVE: &str = "nodes:active";
pub const NODES_REGISTERED: &str = "nodes:registered";

pub fn heartbeat(node_id: &str) -> String {
    format!("node:{node_id}:heartbeat")
}

pub fn registration(node_id: &str) -> String {
    format!("node:{node_id}:registration")
}

pub fn power_history(node_id: &str) -> String {
    format!("node:{node_id}:power_history")
}

pub fn metric_samples(node_id: &str) -> String {
    format!("node:{node_id}:samples")
}

pub fn cluster_nodes(cluster: &str) -> String {
    format!("cluster:{cluster}:nodes")
}

pub fn credential(node_id: &str) -> String {
    format!("node:{node_id}:credential")
}

pub const DEFAULT_CREDENTIAL: &str = "fleet:default_credential";

// ─── Queue keys ───────────────────────────────────────────────────────────────

pub const QUEUE_PROCESSING: &str = "queue:processing";
pub const STATS_QUEUED: &str = "stats:queued";
pub const STATS_COMPLETED: &str = "stats:completed";
pub const STATS_FAILED: &str = "stats:failed";
pub const STATS_COMPLETION_HISTORY: &str = "stats:completion_history";
pub const STATS_FAILURE_HISTORY: &str = "stats:failure_history";

pub fn queue_list(priority: JobPriority) -> String {
    format!("queue:{}", priority.as_str())
}

pub fn job(id: Uuid) -> String {
    format!("job:{id}")
}

pub const JOB_SCAN_PATTERN: &str = "job:*";

// ─── Doctor keys ──────────────────────────────────────────────────────────────

pub const DOCTOR_STATUS: &str = "fleet:doctor:status";
pub const DOCTOR_PROBLEMS: &str = "fleet:doctor:problems";
pub const DOCTOR_HISTORY: &str = "fleet:doctor:history";
pub const DOCTOR_CONFIG: &str = "fleet:doctor:config";
pub const SWARM_STATUS: &str = "fleet:swarm:status";

// ─── Vision keys ──────────────────────────────────────────────────────────────

pub const VISION_NODES: &str = "vision:nodes";
pub const VISION_QUEUE: &str = "vision:queue";
pub const VISION_JOBS: &str = "vision:jobs";
pub const VISION_SCHEDULER_STATUS: &str = "vision:scheduler:status";

// ─── Scaling keys ─────────────────────────────────────────────────────────────

pub const SCALING_CONFIG: &str = "scaling:config";
pub const SCALING_STATE: &str = "scaling:state";
pub const SCALING_HISTORY: &str = "scaling:history";

// ─── Channels ─────────────────────────────────────────────────────────────────

pub const CH_FLEET_EVENTS: &str = "fleet:events";
pub const CH_ALERTS: &str = "alerts";
pub const CH_DOCTOR_EVENTS: &str = "fleet:doctor:events";

pub fn ch_metrics(node_id: &str) -> String {
    format!("metrics:{node_id}")
}

pub fn ch_commands(node_id: &str) -> String {
    format!("commands:{node_id}")
}

pub fn ch_command_results(cmd_id: &str) -> String {
    format!("command_results:{cmd_id}")
}

pub fn ch_logs(node_id: &str) -> String {
    format!("logs:{node_id}")
}

pub fn ch_llm_monitor(session_id: &str) -> String {
    format!("llm-monitor:{session_id}")
}
