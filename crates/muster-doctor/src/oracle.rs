//! The diagnosis oracle.
//!
//! Diagnosis is delegated to an LLM reachable over HTTP. The oracle returns a
//! structured recommendation; any transport failure or malformed reply falls
//! back to a static problem-type → action table so the doctor keeps working
//! with the lights out.

use crate::actions;
use async_trait::async_trait;
use muster_proto::{CoreError, CoreResult, Problem, RiskLevel};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

const LLM_TIMEOUT: Duration = Duration::from_secs(120);

// ─── Diagnosis shape ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendedAction {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub reason: String,
}

/// The structured recommendation contract the oracle must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub diagnosis: String,
    pub root_cause: String,
    #[serde(default)]
    pub recommended_actions: Vec<RecommendedAction>,
    pub can_auto_fix: bool,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub manual_steps: Vec<String>,
}

/// Fleet context included in the prompt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiagnosisContext {
    pub active_nodes: usize,
    pub total_power_w: f32,
    pub node_details: Option<serde_json::Value>,
}

// ─── Oracle seam ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait DiagnosisOracle: Send + Sync {
    async fn diagnose(&self, problem: &Problem, context: &DiagnosisContext)
    -> CoreResult<Diagnosis>;
}

/// Static mapping used when the oracle cannot answer.
pub fn fallback_diagnosis(problem: &Problem) -> Diagnosis {
    let action = actions::default_action(problem.problem_type);
    let recommended_actions = if action == "alert_only" {
        Vec::new()
    } else {
        vec![RecommendedAction {
            action: action.to_string(),
            params: serde_json::json!({}),
            reason: "default action for this problem type".to_string(),
        }]
    };

    Diagnosis {
        diagnosis: format!("Default handling for {}", problem.problem_type),
        root_cause: "diagnosis oracle unavailable".to_string(),
        can_auto_fix: problem.auto_fixable && !recommended_actions.is_empty(),
        recommended_actions,
        risk_level: problem.risk_level,
        manual_steps: vec![
            "Check system logs".to_string(),
            "Review problem details".to_string(),
        ],
    }
}

// ─── LLM-backed implementation ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Oracle backed by an Ollama-style `/api/generate` endpoint.
pub struct LlmOracle {
    endpoint: String,
    model: String,
    client: reqwest::Client,
}

impl LlmOracle {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    fn build_prompt(problem: &Problem, context: &DiagnosisContext) -> String {
        let actions_list: String = actions::catalogue()
            .iter()
            .filter(|a| a.endpoint.is_some())
            .map(|a| format!("- {}: {} (risk: {})\n", a.name, a.description, a.risk_level))
            .collect();

        let problem_json =
            serde_json::to_string_pretty(problem).unwrap_or_else(|_| problem.title.clone());
        let node_details = context
            .node_details
            .as_ref()
            .and_then(|d| serde_json::to_string_pretty(d).ok())
            .unwrap_or_else(|| "N/A".to_string());

        format!(
            "You are the fleet doctor, an autonomous agent managing a GPU compute cluster.\n\n\
             CURRENT PROBLEM:\n{problem_json}\n\n\
             SYSTEM CONTEXT:\n\
             Active nodes: {}\n\
             Total power: {}W\n\n\
             NODE DETAILS:\n{node_details}\n\n\
             AVAILABLE ACTIONS:\n{actions_list}\n\
             Analyze this problem and respond with ONLY valid JSON (no markdown):\n\
             {{\n  \"diagnosis\": \"brief explanation\",\n  \"root_cause\": \"likely root cause\",\n  \
             \"recommended_actions\": [{{\"action\": \"name\", \"params\": {{}}, \"reason\": \"why\"}}],\n  \
             \"can_auto_fix\": true,\n  \"risk_level\": \"low\",\n  \"manual_steps\": []\n}}",
            context.active_nodes, context.total_power_w
        )
    }
}

#[async_trait]
impl DiagnosisOracle for LlmOracle {
    async fn diagnose(
        &self,
        problem: &Problem,
        context: &DiagnosisContext,
    ) -> CoreResult<Diagnosis> {
        let prompt = Self::build_prompt(problem, context);
        let url = format!("{}/api/generate", self.endpoint);

        let resp = self
            .client
            .post(&url)
            .timeout(LLM_TIMEOUT)
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
                "format": "json",
            }))
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("llm request: {e}")))?;

        if !resp.status().is_success() {
            return Err(CoreError::Transient(format!(
                "llm endpoint returned {}",
                resp.status()
            )));
        }

        let body: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::Transient(format!("llm response: {e}")))?;

        serde_json::from_str(&body.response).map_err(|e| {
            warn!(error = %e, "oracle returned malformed diagnosis JSON");
            CoreError::Transient(format!("malformed diagnosis: {e}"))
        })
    }
}
