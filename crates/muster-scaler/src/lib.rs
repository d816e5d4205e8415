//! Auto-scaler: queue depth and GPU utilization in, recommendations out.
//!
//! The scaler only recommends. Actual provisioning (wake-on-LAN, container
//! starts, draining) belongs to whatever consumes the recommendation events.
//! Scale-down requires BOTH a shallow queue and low utilization, which keeps
//! the fleet from flapping around the thresholds.

#![forbid(unsafe_code)]

use chrono::{Duration as ChronoDuration, Utc};
use muster_events::EventBus;
use muster_proto::{
    CoreResult, NodeHeartbeat, QueueDepths, ScaleAction, ScalerState, ScalingConfig,
    ScalingDecision,
};
use muster_store::{StateStore, keys};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// A node counts as idle when it reports no work and a near-zero GPU.
const IDLE_GPU_UTIL_PCT: f32 = 10.0;

/// Aggregated view over live node heartbeats.
#[derive(Debug, Clone, Default)]
struct NodeMetrics {
    active_count: u32,
    avg_gpu_util_pct: f64,
    idle_nodes: Vec<String>,
}

#[derive(Clone)]
pub struct AutoScaler {
    store: Arc<dyn StateStore>,
    bus: EventBus,
}

impl AutoScaler {
    pub fn new(store: Arc<dyn StateStore>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    // ── Config & state ───────────────────────────────────────────────────────

    pub async fn config(&self) -> CoreResult<ScalingConfig> {
        match self.store.get(keys::SCALING_CONFIG).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(ScalingConfig::default()),
        }
    }

    pub async fn set_config(&self, config: &ScalingConfig) -> CoreResult<()> {
        self.store
            .set(keys::SCALING_CONFIG, &serde_json::to_string(config)?)
            .await
    }

    pub async fn state(&self) -> CoreResult<ScalerState> {
        match self.store.get(keys::SCALING_STATE).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(ScalerState::default()),
        }
    }

    async fn set_state(&self, state: &ScalerState) -> CoreResult<()> {
        self.store
            .set(keys::SCALING_STATE, &serde_json::to_string(state)?)
            .await
    }

    pub async fn history(&self, limit: usize) -> CoreResult<Vec<ScalingDecision>> {
        let raw = self
            .store
            .lrange(keys::SCALING_HISTORY, 0, limit as i64 - 1)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|r| serde_json::from_str(r).ok())
            .collect())
    }

    // ── Evaluation ───────────────────────────────────────────────────────────

    /// One evaluation: read metrics, decide, persist state + history, publish
    /// a recommendation event when an action is recommended.
    pub async fn evaluate(&self) -> CoreResult<ScalingDecision> {
        let config = self.config().await?;
        let mut state = self.state().await?;
        let now = Utc::now();

        let depths = self.queue_depths().await?;
        let metrics = self.node_metrics().await?;

        let mut decision = ScalingDecision {
            action: ScaleAction::None,
            reason: None,
            current_nodes: metrics.active_count,
            recommended_nodes: metrics.active_count,
            queue_depth: depths.total(),
            avg_gpu_utilization: metrics.avg_gpu_util_pct,
            idle_nodes: Vec::new(),
            timestamp: now,
        };

        if !config.enabled {
            decision.reason = Some("auto-scaling disabled".to_string());
        } else if let Some(remaining) = self.cooldown_remaining(&state, &config, now) {
            decision.reason = Some(format!("in cooldown ({remaining}s remaining)"));
        } else {
            self.decide(&config, &depths, &metrics, &mut decision);
        }

        self.store
            .lpush(keys::SCALING_HISTORY, &serde_json::to_string(&decision)?)
            .await?;
        self.store
            .ltrim(keys::SCALING_HISTORY, 0, keys::SCALING_HISTORY_CAP - 1)
            .await?;

        if decision.action != ScaleAction::None {
            state.last_action = decision.action;
            state.last_scale_time = Some(now);
            state.last_reason = decision.reason.clone();
            info!(
                action = ?decision.action,
                from = decision.current_nodes,
                to = decision.recommended_nodes,
                reason = decision.reason.as_deref().unwrap_or(""),
                "scaling recommendation"
            );
            self.bus
                .fleet_event(
                    "scaling_recommendation",
                    serde_json::to_value(&decision)?,
                )
                .await;
        }

        state.last_evaluation = Some(now);
        state.current_scale = metrics.active_count;
        state.recommended_scale = decision.recommended_nodes;
        state.queue_depth = depths.total();
        state.avg_gpu_utilization = metrics.avg_gpu_util_pct;
        self.set_state(&state).await?;

        Ok(decision)
    }

    fn decide(
        &self,
        config: &ScalingConfig,
        depths: &QueueDepths,
        metrics: &NodeMetrics,
        decision: &mut ScalingDecision,
    ) {
        let depth = depths.total();
        let util = metrics.avg_gpu_util_pct;
        let active = metrics.active_count;

        let queue_pressed = depth > config.target_queue_depth;
        let gpu_pressed = util > config.scale_up_threshold * 100.0;
        if queue_pressed && gpu_pressed && active < config.max_nodes {
            let needed = (depth / config.target_queue_depth).max(1) as u32;
            decision.action = ScaleAction::ScaleUp;
            decision.recommended_nodes = (active + needed).min(config.max_nodes);
            decision.reason = Some(format!(
                "queue depth {depth} > target {} AND gpu util {util:.1}% > {:.0}%",
                config.target_queue_depth,
                config.scale_up_threshold * 100.0
            ));
            return;
        }

        let queue_shallow = depth < config.target_queue_depth / 2;
        let gpu_quiet = util < config.scale_down_threshold * 100.0;
        if queue_shallow
            && gpu_quiet
            && active > config.min_nodes
            && !metrics.idle_nodes.is_empty()
        {
            let idle_count = metrics.idle_nodes.len() as u32;
            decision.action = ScaleAction::ScaleDown;
            decision.recommended_nodes = active.saturating_sub(idle_count).max(config.min_nodes);
            decision.idle_nodes = metrics.idle_nodes.clone();
            decision.reason = Some(format!(
                "queue depth {depth} < target/2 AND gpu util {util:.1}% < {:.0}%",
                config.scale_down_threshold * 100.0
            ));
        }
    }

    fn cooldown_remaining(
        &self,
        state: &ScalerState,
        config: &ScalingConfig,
        now: chrono::DateTime<Utc>,
    ) -> Option<i64> {
        let last = state.last_scale_time?;
        let elapsed = now.signed_duration_since(last);
        let cooldown = ChronoDuration::seconds(config.cooldown_seconds as i64);
        if elapsed < cooldown {
            Some((cooldown - elapsed).num_seconds())
        } else {
            None
        }
    }

    // ── Inputs ───────────────────────────────────────────────────────────────

    async fn queue_depths(&self) -> CoreResult<QueueDepths> {
        Ok(QueueDepths {
            high: self
                .store
                .llen(&keys::queue_list(muster_proto::JobPriority::High))
                .await?,
            normal: self
                .store
                .llen(&keys::queue_list(muster_proto::JobPriority::Normal))
                .await?,
            low: self
                .store
                .llen(&keys::queue_list(muster_proto::JobPriority::Low))
                .await?,
        })
    }

    async fn node_metrics(&self) -> CoreResult<NodeMetrics> {
        let mut metrics = NodeMetrics::default();
        let mut total_util = 0.0f64;

        for node_id in self.store.smembers(keys::NODES_ACTIVE).await? {
            let Some(raw) = self.store.get(&keys::heartbeat(&node_id)).await? else {
                continue;
            };
            let Ok(hb) = serde_json::from_str::<NodeHeartbeat>(&raw) else {
                continue;
            };

            metrics.active_count += 1;
            let util = hb.avg_gpu_util();
            total_util += util as f64;

            let idle_activity = hb
                .activity
                .as_ref()
                .is_some_and(|a| (a.status == "idle" || a.status == "ready") && a.containers == 0);
            if idle_activity && util < IDLE_GPU_UTIL_PCT {
                metrics.idle_nodes.push(node_id);
            }
        }

        if metrics.active_count > 0 {
            metrics.avg_gpu_util_pct = total_util / metrics.active_count as f64;
        }
        metrics.idle_nodes.sort();
        Ok(metrics)
    }

    // ── Ticker ───────────────────────────────────────────────────────────────

    /// Evaluate on the configured interval until shutdown. A failed cycle is
    /// logged and the next one runs anyway.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("auto-scaler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.evaluate().await {
                error!(error = %e, "scaler evaluation failed");
                self.bus
                    .fleet_event(
                        "error",
                        serde_json::json!({"component": "scaler", "error": e.to_string()}),
                    )
                    .await;
            }

            let interval = self
                .config()
                .await
                .map(|c| c.check_interval_seconds)
                .unwrap_or(30);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
            }
        }
        info!("auto-scaler stopped");
    }
}
