//! Problem detection.
//!
//! Each detector is a pure function over a [`FleetView`] snapshot. The view
//! is read from the store once per cycle; detectors never touch I/O, which
//! keeps them trivially testable and means one broken detector cannot wedge
//! the cycle.

use chrono::Utc;
use muster_proto::{CoreResult, NodeHeartbeat, Problem, ProblemType, RiskLevel, Severity};
use muster_queue::FailureRecord;
use muster_store::{StateStore, keys};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

// ─── Detector thresholds ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub disk_warn_pct: f32,
    pub disk_crit_pct: f32,
    pub memory_pct: f32,
    pub gpu_temp_c: f32,
    pub job_failure_threshold: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            disk_warn_pct: 85.0,
            disk_crit_pct: 95.0,
            memory_pct: 90.0,
            gpu_temp_c: 90.0,
            job_failure_threshold: 3,
        }
    }
}

// ─── Fleet snapshot ───────────────────────────────────────────────────────────

/// Container-orchestrator node state as cached under `fleet:swarm:status`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SwarmStatus {
    #[serde(default)]
    pub nodes: Vec<SwarmNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmNode {
    pub hostname: String,
    pub state: String,
    pub availability: String,
}

/// One snapshot of everything the detectors look at.
#[derive(Debug, Clone, Default)]
pub struct FleetView {
    /// Members of the active set, whether or not a heartbeat survives.
    pub active_nodes: Vec<String>,
    /// Live (unexpired) heartbeats by node id.
    pub heartbeats: HashMap<String, NodeHeartbeat>,
    pub swarm: Option<SwarmStatus>,
    pub recent_failures: Vec<FailureRecord>,
}

impl FleetView {
    /// Read the current fleet state out of the store.
    pub async fn load(store: &dyn StateStore) -> CoreResult<Self> {
        let active_nodes = store.smembers(keys::NODES_ACTIVE).await?;

        let mut heartbeats = HashMap::new();
        for node_id in &active_nodes {
            let Some(raw) = store.get(&keys::heartbeat(node_id)).await? else {
                continue;
            };
            match serde_json::from_str::<NodeHeartbeat>(&raw) {
                Ok(hb) => {
                    heartbeats.insert(node_id.clone(), hb);
                }
                Err(e) => warn!(node = %node_id, error = %e, "unreadable heartbeat in fleet view"),
            }
        }

        let swarm = match store.get(keys::SWARM_STATUS).await? {
            Some(raw) => serde_json::from_str(&raw).ok(),
            None => None,
        };

        let recent_failures = store
            .lrange(keys::STATS_FAILURE_HISTORY, 0, keys::FAILURE_HISTORY_CAP - 1)
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect();

        Ok(Self {
            active_nodes,
            heartbeats,
            swarm,
            recent_failures,
        })
    }
}

// ─── Detector trait & set ─────────────────────────────────────────────────────

pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, view: &FleetView, config: &DetectorConfig) -> Vec<Problem>;
}

/// The standard detector set.
pub fn default_detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(OfflineNodeDetector),
        Box::new(DiskUsageDetector),
        Box::new(MemoryDetector),
        Box::new(SwarmHealthDetector),
        Box::new(JobFailureDetector),
        Box::new(GpuTempDetector),
    ]
}

/// Run every detector and merge the findings.
pub fn detect_all(
    view: &FleetView,
    config: &DetectorConfig,
    detectors: &[Box<dyn Detector>],
) -> Vec<Problem> {
    let mut problems = Vec::new();
    for detector in detectors {
        problems.extend(detector.detect(view, config));
    }
    problems
}

fn problem_id(problem_type: ProblemType, node: Option<&str>) -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    match node {
        Some(node) => format!("{problem_type}_{node}_{stamp}"),
        None => format!("{problem_type}_{stamp}"),
    }
}

// ─── OfflineNode ──────────────────────────────────────────────────────────────

/// A node in the active set whose heartbeat key has expired.
pub struct OfflineNodeDetector;

impl Detector for OfflineNodeDetector {
    fn name(&self) -> &'static str {
        "offline_node"
    }

    fn detect(&self, view: &FleetView, _config: &DetectorConfig) -> Vec<Problem> {
        view.active_nodes
            .iter()
            .filter(|id| !view.heartbeats.contains_key(*id))
            .map(|id| Problem {
                id: problem_id(ProblemType::OfflineNode, Some(id)),
                problem_type: ProblemType::OfflineNode,
                severity: Severity::Critical,
                node_id: Some(id.clone()),
                title: format!("Node {id} is offline"),
                description: format!(
                    "Node {id} has not sent a heartbeat within the liveness window"
                ),
                details: serde_json::json!({"node_id": id}),
                detected_at: Utc::now(),
                // Needs power cycling or cabling; nothing we can do remotely.
                auto_fixable: false,
                risk_level: RiskLevel::High,
            })
            .collect()
    }
}

// ─── Disk usage ───────────────────────────────────────────────────────────────

pub struct DiskUsageDetector;

impl Detector for DiskUsageDetector {
    fn name(&self) -> &'static str {
        "disk_usage"
    }

    fn detect(&self, view: &FleetView, config: &DetectorConfig) -> Vec<Problem> {
        let mut problems = Vec::new();
        for (id, hb) in &view.heartbeats {
            let pct = hb.system.disk_pct;
            let details = serde_json::json!({
                "node_id": id,
                "disk_percent": pct,
                "disk_free_gb": hb.system.disk_free_gb,
            });
            if pct >= config.disk_crit_pct {
                problems.push(Problem {
                    id: problem_id(ProblemType::CriticalDisk, Some(id)),
                    problem_type: ProblemType::CriticalDisk,
                    severity: Severity::Critical,
                    node_id: Some(id.clone()),
                    title: format!("Critical disk usage on {id}: {pct:.1}%"),
                    description: format!("Node {id} disk usage is critically high at {pct:.1}%"),
                    details,
                    detected_at: Utc::now(),
                    auto_fixable: true,
                    risk_level: RiskLevel::Medium,
                });
            } else if pct >= config.disk_warn_pct {
                problems.push(Problem {
                    id: problem_id(ProblemType::HighDisk, Some(id)),
                    problem_type: ProblemType::HighDisk,
                    severity: Severity::Warning,
                    node_id: Some(id.clone()),
                    title: format!("High disk usage on {id}: {pct:.1}%"),
                    description: format!("Node {id} disk usage is elevated at {pct:.1}%"),
                    details,
                    detected_at: Utc::now(),
                    auto_fixable: true,
                    risk_level: RiskLevel::Low,
                });
            }
        }
        problems
    }
}

// ─── Memory ───────────────────────────────────────────────────────────────────

pub struct MemoryDetector;

impl Detector for MemoryDetector {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn detect(&self, view: &FleetView, config: &DetectorConfig) -> Vec<Problem> {
        let mut problems = Vec::new();
        for (id, hb) in &view.heartbeats {
            let pct = hb.system.mem_pct;
            if pct >= config.memory_pct {
                problems.push(Problem {
                    id: problem_id(ProblemType::HighMemory, Some(id)),
                    problem_type: ProblemType::HighMemory,
                    severity: Severity::Warning,
                    node_id: Some(id.clone()),
                    title: format!("High memory usage on {id}: {pct:.1}%"),
                    description: format!("Node {id} memory usage is elevated at {pct:.1}%"),
                    details: serde_json::json!({"node_id": id, "memory_percent": pct}),
                    detected_at: Utc::now(),
                    // Memory pressure usually needs a human to pick a victim.
                    auto_fixable: false,
                    risk_level: RiskLevel::Medium,
                });
            }
        }
        problems
    }
}

// ─── Swarm health ─────────────────────────────────────────────────────────────

pub struct SwarmHealthDetector;

impl Detector for SwarmHealthDetector {
    fn name(&self) -> &'static str {
        "swarm_health"
    }

    fn detect(&self, view: &FleetView, _config: &DetectorConfig) -> Vec<Problem> {
        let Some(swarm) = &view.swarm else {
            return Vec::new();
        };
        swarm
            .nodes
            .iter()
            .filter(|n| n.state != "ready" || n.availability != "active")
            .map(|n| Problem {
                id: problem_id(ProblemType::SwarmUnhealthy, Some(&n.hostname)),
                problem_type: ProblemType::SwarmUnhealthy,
                severity: Severity::Warning,
                node_id: Some(n.hostname.clone()),
                title: format!("Swarm node {} is not ready", n.hostname),
                description: format!(
                    "Swarm node {} state: {}, availability: {}",
                    n.hostname, n.state, n.availability
                ),
                details: serde_json::json!({
                    "hostname": n.hostname,
                    "state": n.state,
                    "availability": n.availability,
                }),
                detected_at: Utc::now(),
                auto_fixable: true,
                risk_level: RiskLevel::Medium,
            })
            .collect()
    }
}

// ─── Job failures ─────────────────────────────────────────────────────────────

/// Repeated failures of the same job type in the recent-failure window.
pub struct JobFailureDetector;

impl Detector for JobFailureDetector {
    fn name(&self) -> &'static str {
        "job_failures"
    }

    fn detect(&self, view: &FleetView, config: &DetectorConfig) -> Vec<Problem> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for failure in &view.recent_failures {
            *counts.entry(failure.job_type.as_str()).or_insert(0) += 1;
        }

        let mut problems: Vec<Problem> = counts
            .into_iter()
            .filter(|(_, count)| *count >= config.job_failure_threshold)
            .map(|(job_type, count)| Problem {
                id: problem_id(ProblemType::JobFailures, Some(job_type)),
                problem_type: ProblemType::JobFailures,
                severity: Severity::Warning,
                node_id: None,
                title: format!("Job type '{job_type}' failing repeatedly ({count} failures)"),
                description: format!(
                    "Jobs of type '{job_type}' have failed {count} times recently"
                ),
                details: serde_json::json!({
                    "job_type": job_type,
                    "failure_count": count,
                    "threshold": config.job_failure_threshold,
                }),
                detected_at: Utc::now(),
                auto_fixable: true,
                risk_level: RiskLevel::Low,
            })
            .collect();
        problems.sort_by(|a, b| a.title.cmp(&b.title));
        problems
    }
}

// ─── GPU temperature ──────────────────────────────────────────────────────────

pub struct GpuTempDetector;

impl Detector for GpuTempDetector {
    fn name(&self) -> &'static str {
        "gpu_temp"
    }

    fn detect(&self, view: &FleetView, config: &DetectorConfig) -> Vec<Problem> {
        let mut problems = Vec::new();
        for (id, hb) in &view.heartbeats {
            for gpu in &hb.gpus {
                if gpu.temp_c >= config.gpu_temp_c {
                    problems.push(Problem {
                        id: problem_id(ProblemType::HighGpuTemp, Some(id)),
                        problem_type: ProblemType::HighGpuTemp,
                        severity: Severity::Warning,
                        node_id: Some(id.clone()),
                        title: format!(
                            "GPU {} on {id} running hot: {:.0}°C",
                            gpu.index, gpu.temp_c
                        ),
                        description: format!(
                            "GPU {} ({}) on node {id} reports {:.0}°C",
                            gpu.index, gpu.name, gpu.temp_c
                        ),
                        details: serde_json::json!({
                            "node_id": id,
                            "gpu_index": gpu.index,
                            "temp_c": gpu.temp_c,
                        }),
                        detected_at: Utc::now(),
                        auto_fixable: false,
                        risk_level: RiskLevel::Medium,
                    });
                }
            }
        }
        problems
    }
}
