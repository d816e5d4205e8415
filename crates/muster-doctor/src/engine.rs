//! The healing cycle itself.
//!
//! Order of one cycle: detect, reconcile the stored problem set, then per
//! problem walk the gates (auto-fix enabled, per-node cooldown, hourly
//! budget), diagnose, execute allowed actions, and log. A failed cycle is
//! logged and published; the next tick runs regardless.

use crate::actions::{self, ActionRunner};
use crate::oracle::{Diagnosis, DiagnosisContext, DiagnosisOracle, fallback_diagnosis};
use crate::problems::{Detector, DetectorConfig, FleetView, default_detectors, detect_all};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use muster_events::EventBus;
use muster_proto::{ActionResult, CoreResult, Problem, RiskLevel};
use muster_store::{StateStore, keys};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

// ─── Configuration ────────────────────────────────────────────────────────────

fn default_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_auto_fix_levels() -> Vec<RiskLevel> {
    vec![RiskLevel::Low, RiskLevel::Medium]
}

fn default_cooldown_minutes() -> i64 {
    5
}

fn default_max_actions() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorConfig {
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_true")]
    pub auto_fix: bool,
    #[serde(default = "default_auto_fix_levels")]
    pub auto_fix_levels: Vec<RiskLevel>,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    #[serde(default = "default_max_actions")]
    pub max_actions_per_hour: usize,
    #[serde(default)]
    pub detector: DetectorConfig,
}

impl Default for DoctorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            auto_fix: true,
            auto_fix_levels: default_auto_fix_levels(),
            cooldown_minutes: default_cooldown_minutes(),
            max_actions_per_hour: default_max_actions(),
            detector: DetectorConfig::default(),
        }
    }
}

// ─── Reports & records ────────────────────────────────────────────────────────

/// What one cycle did, mostly for tests and the status key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub problems_found: usize,
    pub actions_executed: usize,
    pub alerts: usize,
    pub escalations: usize,
    pub skipped_cooldown: usize,
    pub skipped_rate_limited: usize,
}

/// One entry in the doctor's capped history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub problem: Problem,
    pub diagnosis: Diagnosis,
    pub result: ActionResult,
}

/// Status record under `fleet:doctor:status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorStatus {
    pub status: String,
    pub last_check: Option<DateTime<Utc>>,
    pub problems_count: usize,
    pub actions_this_hour: usize,
    pub updated_at: DateTime<Utc>,
}

// In-memory rate-limit state. A cache only: restart forgets cooldowns, which
// errs on the side of acting once more, bounded by the hourly budget.
#[derive(Default)]
struct Limits {
    cooldowns: HashMap<String, DateTime<Utc>>,
    action_times: VecDeque<DateTime<Utc>>,
}

impl Limits {
    fn in_cooldown(&self, node_id: &str, window: ChronoDuration, now: DateTime<Utc>) -> bool {
        self.cooldowns
            .get(node_id)
            .is_some_and(|last| now.signed_duration_since(*last) < window)
    }

    fn actions_in_last_hour(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - ChronoDuration::hours(1);
        while let Some(front) = self.action_times.front() {
            if *front < cutoff {
                self.action_times.pop_front();
            } else {
                break;
            }
        }
        self.action_times.len()
    }

    fn record_action(&mut self, node_id: Option<&str>, now: DateTime<Utc>) {
        if let Some(node) = node_id {
            self.cooldowns.insert(node.to_string(), now);
        }
        self.action_times.push_back(now);
    }
}

// ─── Doctor ───────────────────────────────────────────────────────────────────

pub struct Doctor {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    runner: Arc<dyn ActionRunner>,
    oracle: Arc<dyn DiagnosisOracle>,
    base_config: DoctorConfig,
    detectors: Vec<Box<dyn Detector>>,
    limits: Mutex<Limits>,
}

impl Doctor {
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: EventBus,
        runner: Arc<dyn ActionRunner>,
        oracle: Arc<dyn DiagnosisOracle>,
        config: DoctorConfig,
    ) -> Self {
        Self {
            store,
            bus,
            runner,
            oracle,
            base_config: config,
            detectors: default_detectors(),
            limits: Mutex::new(Limits::default()),
        }
    }

    // ── Config & queries ─────────────────────────────────────────────────────

    /// Process config overridden by whatever operators stored under
    /// `fleet:doctor:config`. Re-read each cycle so changes apply live.
    async fn effective_config(&self) -> DoctorConfig {
        match self.store.get(keys::DOCTOR_CONFIG).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "unreadable doctor config override, using defaults");
                    self.base_config.clone()
                }
            },
            _ => self.base_config.clone(),
        }
    }

    pub async fn update_config(&self, config: &DoctorConfig) -> CoreResult<()> {
        self.store
            .set(keys::DOCTOR_CONFIG, &serde_json::to_string(config)?)
            .await
    }

    pub async fn status(&self) -> CoreResult<Option<DoctorStatus>> {
        match self.store.get(keys::DOCTOR_STATUS).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub async fn problems(&self) -> CoreResult<Vec<Problem>> {
        let mut problems: Vec<Problem> = self
            .store
            .hgetall(keys::DOCTOR_PROBLEMS)
            .await?
            .into_values()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        problems.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(problems)
    }

    pub async fn history(&self, limit: usize) -> CoreResult<Vec<HistoryEntry>> {
        let raw = self
            .store
            .lrange(keys::DOCTOR_HISTORY, 0, limit as i64 - 1)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|r| serde_json::from_str(r).ok())
            .collect())
    }

    // ── The cycle ────────────────────────────────────────────────────────────

    /// One full detect → diagnose → act → log pass.
    pub async fn run_cycle(&self) -> CoreResult<CycleReport> {
        let config = self.effective_config().await;
        let now = Utc::now();
        let mut report = CycleReport::default();

        self.write_status("checking", 0, now).await;

        let view = FleetView::load(&*self.store).await?;
        let problems = detect_all(&view, &config.detector, &self.detectors);
        report.problems_found = problems.len();

        // Reconcile: the stored set is replaced wholesale each cycle.
        self.store.delete(keys::DOCTOR_PROBLEMS).await?;
        for problem in &problems {
            self.store
                .hset(
                    keys::DOCTOR_PROBLEMS,
                    &problem.id,
                    &serde_json::to_string(problem)?,
                )
                .await?;
        }

        if problems.is_empty() {
            self.write_status("healthy", 0, now).await;
            return Ok(report);
        }
        info!(count = problems.len(), "doctor found problems");

        for problem in &problems {
            self.bus
                .doctor_event("problem_detected", serde_json::to_value(problem)?)
                .await;

            if !config.auto_fix {
                report.alerts += 1;
                self.bus
                    .alert(
                        "alert",
                        serde_json::json!({
                            "problem": problem,
                            "message": "auto-fix disabled, manual intervention required",
                        }),
                    )
                    .await;
                continue;
            }

            let now = Utc::now();
            if let Some(node_id) = &problem.node_id
                && self.limits.lock().in_cooldown(
                    node_id,
                    ChronoDuration::minutes(config.cooldown_minutes),
                    now,
                )
            {
                debug!(node = %node_id, "skipping problem, node in cooldown");
                report.skipped_cooldown += 1;
                continue;
            }

            if self.limits.lock().actions_in_last_hour(now) >= config.max_actions_per_hour {
                warn!(limit = config.max_actions_per_hour, "hourly action budget spent");
                report.skipped_rate_limited += 1;
                self.bus
                    .doctor_event(
                        "rate_limited",
                        serde_json::json!({"limit": config.max_actions_per_hour}),
                    )
                    .await;
                continue;
            }

            let context = self.build_context(&view, problem);
            let diagnosis = match self.oracle.diagnose(problem, &context).await {
                Ok(diagnosis) => diagnosis,
                Err(e) => {
                    warn!(problem = %problem.id, error = %e, "oracle unavailable, using fallback");
                    fallback_diagnosis(problem)
                }
            };
            self.bus
                .doctor_event(
                    "diagnosis_complete",
                    serde_json::json!({"problem": problem, "diagnosis": diagnosis}),
                )
                .await;

            if diagnosis.can_auto_fix && config.auto_fix_levels.contains(&diagnosis.risk_level) {
                self.execute_actions(problem, &diagnosis, &config, &mut report)
                    .await?;
            } else {
                report.escalations += 1;
                let reason = format!(
                    "risk level {} requires human approval",
                    diagnosis.risk_level
                );
                self.bus
                    .doctor_event(
                        "escalation",
                        serde_json::json!({
                            "problem": problem,
                            "diagnosis": diagnosis,
                            "reason": reason,
                        }),
                    )
                    .await;
                self.bus
                    .alert(
                        "alert",
                        serde_json::json!({"problem": problem, "reason": reason}),
                    )
                    .await;
            }
        }

        self.write_status("running", report.problems_found, Utc::now())
            .await;
        Ok(report)
    }

    async fn execute_actions(
        &self,
        problem: &Problem,
        diagnosis: &Diagnosis,
        config: &DoctorConfig,
        report: &mut CycleReport,
    ) -> CoreResult<()> {
        for recommended in &diagnosis.recommended_actions {
            let Some(spec) = actions::lookup(&recommended.action) else {
                warn!(action = %recommended.action, "oracle recommended unknown action");
                continue;
            };

            // The catalogue risk gates too: a diagnosis cannot launder a
            // medium-risk action through a low-risk claim.
            if !config.auto_fix_levels.contains(&spec.risk_level) {
                report.escalations += 1;
                self.bus
                    .doctor_event(
                        "escalation",
                        serde_json::json!({
                            "problem": problem,
                            "reason": format!(
                                "action {} is {} risk, outside the auto-fix set",
                                spec.name, spec.risk_level
                            ),
                        }),
                    )
                    .await;
                continue;
            }

            let credential = self.node_credential(problem.node_id.as_deref()).await;
            let result = self
                .runner
                .execute(
                    &recommended.action,
                    problem.node_id.as_deref(),
                    recommended.params.clone(),
                    credential.as_deref(),
                )
                .await;

            self.log_history(problem, diagnosis, &result).await?;
            report.actions_executed += 1;

            if result.success {
                self.bus
                    .doctor_event("action_completed", serde_json::to_value(&result)?)
                    .await;
            } else {
                self.bus
                    .doctor_event("action_failed", serde_json::to_value(&result)?)
                    .await;
            }

            // alert_only is free; real actions consume cooldown and budget.
            if recommended.action != "alert_only" {
                self.limits
                    .lock()
                    .record_action(problem.node_id.as_deref(), Utc::now());
            }
        }
        Ok(())
    }

    fn build_context(&self, view: &FleetView, problem: &Problem) -> DiagnosisContext {
        let total_power_w = view
            .heartbeats
            .values()
            .filter_map(|hb| hb.power.as_ref())
            .map(|p| p.total_w)
            .sum();
        let node_details = problem
            .node_id
            .as_ref()
            .and_then(|id| view.heartbeats.get(id))
            .and_then(|hb| serde_json::to_value(hb).ok());
        DiagnosisContext {
            active_nodes: view.active_nodes.len(),
            total_power_w,
            node_details,
        }
    }

    async fn node_credential(&self, node_id: Option<&str>) -> Option<String> {
        let node_id = node_id?;
        if let Ok(Some(cred)) = self.store.get(&keys::credential(node_id)).await {
            return Some(cred);
        }
        self.store.get(keys::DEFAULT_CREDENTIAL).await.ok()?
    }

    async fn log_history(
        &self,
        problem: &Problem,
        diagnosis: &Diagnosis,
        result: &ActionResult,
    ) -> CoreResult<()> {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            problem: problem.clone(),
            diagnosis: diagnosis.clone(),
            result: result.clone(),
        };
        self.store
            .lpush(keys::DOCTOR_HISTORY, &serde_json::to_string(&entry)?)
            .await?;
        self.store
            .ltrim(keys::DOCTOR_HISTORY, 0, keys::DOCTOR_HISTORY_CAP - 1)
            .await
    }

    async fn write_status(&self, status: &str, problems_count: usize, now: DateTime<Utc>) {
        let actions_this_hour = self.limits.lock().actions_in_last_hour(now);
        let record = DoctorStatus {
            status: status.to_string(),
            last_check: Some(now),
            problems_count,
            actions_this_hour,
            updated_at: now,
        };
        if let Ok(raw) = serde_json::to_string(&record) {
            let _ = self.store.set(keys::DOCTOR_STATUS, &raw).await;
        }
    }

    // ── Loop ─────────────────────────────────────────────────────────────────

    /// Run cycles on the configured interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("fleet doctor started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "doctor cycle failed");
                self.bus
                    .doctor_event("error", serde_json::json!({"error": e.to_string()}))
                    .await;
            }

            let interval = self.effective_config().await.interval_seconds;
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
            }
        }
        self.write_status("stopped", 0, Utc::now()).await;
        info!("fleet doctor stopped");
    }
}
