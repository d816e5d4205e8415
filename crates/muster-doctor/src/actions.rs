//! The remediation action catalogue and its executor.
//!
//! Actions run against the control plane's own maintenance surface, never
//! straight at worker shells. `alert_only` is the explicit no-op: it logs,
//! emits an event, and is exempt from the hourly action budget.

use async_trait::async_trait;
use chrono::Utc;
use muster_proto::{ActionResult, ProblemType, RiskLevel};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

const ACTION_TIMEOUT: Duration = Duration::from_secs(120);

// ─── Catalogue ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ActionSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Maintenance endpoint, `None` for alert_only.
    pub endpoint: Option<&'static str>,
    pub default_params: serde_json::Value,
    pub risk_level: RiskLevel,
    pub requires_node: bool,
}

/// Every remediation the doctor may execute.
pub fn catalogue() -> &'static [ActionSpec] {
    static CATALOGUE: OnceLock<Vec<ActionSpec>> = OnceLock::new();
    CATALOGUE.get_or_init(|| {
        vec![
            ActionSpec {
                name: "disk_cleanup",
                description: "Clean up disk space (docker, logs, apt cache, tmp)",
                endpoint: Some("/api/maintenance/disk/cleanup"),
                default_params: serde_json::json!({"actions": ["docker", "logs", "apt", "tmp"]}),
                risk_level: RiskLevel::Low,
                requires_node: true,
            },
            ActionSpec {
                name: "aggressive_cleanup",
                description: "Aggressive disk cleanup including pip cache and journals",
                endpoint: Some("/api/maintenance/disk/cleanup"),
                default_params: serde_json::json!({
                    "actions": ["docker", "logs", "apt", "tmp", "pip", "journal"]
                }),
                risk_level: RiskLevel::Medium,
                requires_node: true,
            },
            ActionSpec {
                name: "restart_agent",
                description: "Restart the worker agent service on the node",
                endpoint: Some("/api/maintenance/restart-agent"),
                default_params: serde_json::json!({}),
                risk_level: RiskLevel::Low,
                requires_node: true,
            },
            ActionSpec {
                name: "fix_s3_mounts",
                description: "Repair S3/MinIO mount points on the node",
                endpoint: Some("/api/maintenance/fix-s3-mounts"),
                default_params: serde_json::json!({}),
                risk_level: RiskLevel::Low,
                requires_node: true,
            },
            ActionSpec {
                name: "health_check",
                description: "Run a comprehensive health check on the node",
                endpoint: Some("/api/maintenance/health-check"),
                default_params: serde_json::json!({}),
                risk_level: RiskLevel::Low,
                requires_node: true,
            },
            ActionSpec {
                name: "prune_docker",
                description: "Prune docker images, containers, and volumes",
                endpoint: Some("/api/maintenance/disk/cleanup"),
                default_params: serde_json::json!({"actions": ["docker"]}),
                risk_level: RiskLevel::Low,
                requires_node: true,
            },
            ActionSpec {
                name: "retry_job",
                description: "Retry a failed job",
                endpoint: Some("/api/queue/jobs/{job_id}/retry"),
                default_params: serde_json::json!({}),
                risk_level: RiskLevel::Low,
                requires_node: false,
            },
            ActionSpec {
                name: "alert_only",
                description: "No action; log and alert",
                endpoint: None,
                default_params: serde_json::json!({}),
                risk_level: RiskLevel::Low,
                requires_node: false,
            },
        ]
    })
}

pub fn lookup(name: &str) -> Option<&'static ActionSpec> {
    catalogue().iter().find(|a| a.name == name)
}

/// Fallback action per problem type when the oracle is unavailable.
pub fn default_action(problem_type: ProblemType) -> &'static str {
    match problem_type {
        ProblemType::HighDisk => "disk_cleanup",
        ProblemType::CriticalDisk => "aggressive_cleanup",
        ProblemType::AgentDown => "restart_agent",
        ProblemType::S3MountMissing => "fix_s3_mounts",
        // Restarting docker or touching memory under pressure is riskier
        // than waking an operator.
        ProblemType::HighMemory
        | ProblemType::OfflineNode
        | ProblemType::DockerDown
        | ProblemType::SwarmUnhealthy
        | ProblemType::JobFailures
        | ProblemType::HighGpuTemp => "alert_only",
    }
}

// ─── Executor ─────────────────────────────────────────────────────────────────

/// Executes remediation actions. Never returns `Err`: every outcome is an
/// [`ActionResult`] so the cycle can log and move on.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn execute(
        &self,
        action: &str,
        node_id: Option<&str>,
        params: serde_json::Value,
        credential_id: Option<&str>,
    ) -> ActionResult;
}

/// Production runner: POSTs to the control plane's maintenance API.
pub struct HttpActionRunner {
    api_base: String,
    client: reqwest::Client,
}

impl HttpActionRunner {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            client: reqwest::Client::new(),
        }
    }

    fn failure(action: &str, node_id: Option<&str>, message: String) -> ActionResult {
        ActionResult {
            success: false,
            action: action.to_string(),
            node_id: node_id.map(str::to_string),
            message,
            details: serde_json::json!({}),
            executed_at: Utc::now(),
            duration_ms: 0,
        }
    }
}

#[async_trait]
impl ActionRunner for HttpActionRunner {
    async fn execute(
        &self,
        action: &str,
        node_id: Option<&str>,
        params: serde_json::Value,
        credential_id: Option<&str>,
    ) -> ActionResult {
        let started = Utc::now();

        let Some(spec) = lookup(action) else {
            return Self::failure(action, node_id, format!("unknown action: {action}"));
        };

        let Some(endpoint) = spec.endpoint else {
            info!(action, node = ?node_id, "alert-only action, nothing executed");
            return ActionResult {
                success: true,
                action: action.to_string(),
                node_id: node_id.map(str::to_string),
                message: "alert logged, no auto-fix action taken".to_string(),
                details: serde_json::json!({"action": "alert_only"}),
                executed_at: started,
                duration_ms: 0,
            };
        };

        if spec.requires_node && node_id.is_none() {
            return Self::failure(action, node_id, "node id required for this action".into());
        }

        // Merge defaults under the caller's params.
        let mut body = spec.default_params.clone();
        if let (Some(base), Some(extra)) = (body.as_object_mut(), params.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        if let Some(obj) = body.as_object_mut() {
            if let Some(node) = node_id {
                obj.insert("node_id".into(), serde_json::json!(node));
            }
            if let Some(cred) = credential_id {
                obj.insert("credential_id".into(), serde_json::json!(cred));
            }
        }

        let mut endpoint = endpoint.to_string();
        if endpoint.contains("{job_id}") {
            let Some(job_id) = body.get("job_id").and_then(|v| v.as_str()).map(str::to_string)
            else {
                return Self::failure(action, node_id, "job_id required for retry action".into());
            };
            endpoint = endpoint.replace("{job_id}", &job_id);
        }

        let url = format!("{}{}", self.api_base, endpoint);
        let response = self
            .client
            .post(&url)
            .timeout(ACTION_TIMEOUT)
            .json(&body)
            .send()
            .await;

        let duration_ms = Utc::now()
            .signed_duration_since(started)
            .num_milliseconds()
            .max(0) as u64;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let details = resp
                    .json::<serde_json::Value>()
                    .await
                    .unwrap_or_else(|_| serde_json::json!({}));
                info!(action, node = ?node_id, duration_ms, "action completed");
                ActionResult {
                    success: true,
                    action: action.to_string(),
                    node_id: node_id.map(str::to_string),
                    message: format!("action {action} completed"),
                    details,
                    executed_at: started,
                    duration_ms,
                }
            }
            Ok(resp) => {
                let status = resp.status();
                let snippet: String = resp.text().await.unwrap_or_default().chars().take(500).collect();
                warn!(action, node = ?node_id, %status, "action rejected");
                ActionResult {
                    success: false,
                    action: action.to_string(),
                    node_id: node_id.map(str::to_string),
                    message: format!("action failed with status {status}"),
                    details: serde_json::json!({"status": status.as_u16(), "response": snippet}),
                    executed_at: started,
                    duration_ms,
                }
            }
            Err(e) => {
                warn!(action, node = ?node_id, error = %e, "action request failed");
                ActionResult {
                    success: false,
                    action: action.to_string(),
                    node_id: node_id.map(str::to_string),
                    message: format!("action execution error: {e}"),
                    details: serde_json::json!({"error": e.to_string()}),
                    executed_at: started,
                    duration_ms,
                }
            }
        }
    }
}
