//! Node registry: the authoritative live-node view.
//!
//! Workers register once and then heartbeat on an interval; liveness is
//! derived purely from the TTL of the heartbeat key. There is no reaper
//! thread — readers that find an active-set member without a heartbeat
//! lazily drop it from the set.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use muster_events::EventBus;
use muster_proto::{
    CoreError, CoreResult, NodeHeartbeat, NodeRegistration, NodeStatus, PowerSample,
    validate_node_id,
};
use muster_store::{StateStore, keys};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// ─── Stored records ───────────────────────────────────────────────────────────

/// Registration record as persisted under `node:{id}:registration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredNode {
    #[serde(flatten)]
    pub registration: NodeRegistration,
    pub registered_at: DateTime<Utc>,
}

/// One entry in a node's capped metric-sample ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub disk_pct: f32,
    pub gpu_util_pct: f32,
    pub power_w: Option<f32>,
}

/// Merged registration + latest heartbeat, with TTL-derived status.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub node_id: String,
    pub status: NodeStatus,
    pub cluster: Option<String>,
    pub registration: Option<RegisteredNode>,
    pub heartbeat: Option<NodeHeartbeat>,
}

impl NodeView {
    fn from_parts(
        node_id: String,
        registration: Option<RegisteredNode>,
        heartbeat: Option<NodeHeartbeat>,
    ) -> Self {
        let status = match &heartbeat {
            Some(hb) => hb.status.unwrap_or(NodeStatus::Online),
            None => NodeStatus::Offline,
        };
        let cluster = heartbeat
            .as_ref()
            .and_then(|hb| hb.cluster.clone())
            .or_else(|| {
                registration
                    .as_ref()
                    .and_then(|r| r.registration.cluster.clone())
            });
        Self {
            node_id,
            status,
            cluster,
            registration,
            heartbeat,
        }
    }
}

/// Aggregate fleet snapshot for dashboards and the doctor's context prompt.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSummary {
    pub active_nodes: u32,
    pub computing_nodes: u32,
    pub total_power_w: f32,
    pub total_gpu_power_w: f32,
    pub clusters: HashMap<String, u32>,
    pub generated_at: DateTime<Utc>,
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// The process-wide node registry.
#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    heartbeat_ttl: Duration,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn StateStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            heartbeat_ttl: keys::HEARTBEAT_TTL,
        }
    }

    /// Override the heartbeat TTL (tests and non-default deployments).
    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    /// Register a worker. Idempotent: re-registering overwrites the record.
    pub async fn register(&self, registration: NodeRegistration) -> CoreResult<()> {
        if !validate_node_id(&registration.node_id) {
            return Err(CoreError::Validation(format!(
                "invalid node id: {:?}",
                registration.node_id
            )));
        }

        let node_id = registration.node_id.clone();
        let cluster = registration.cluster.clone();
        let record = RegisteredNode {
            registration,
            registered_at: Utc::now(),
        };

        self.store
            .set(&keys::registration(&node_id), &serde_json::to_string(&record)?)
            .await?;
        self.store.sadd(keys::NODES_REGISTERED, &node_id).await?;
        self.store.sadd(keys::NODES_ACTIVE, &node_id).await?;
        if let Some(cluster) = &cluster {
            self.store
                .sadd(&keys::cluster_nodes(cluster), &node_id)
                .await?;
        }

        info!(node = %node_id, cluster = ?cluster, "node registered");
        self.bus
            .fleet_event(
                "node_registered",
                serde_json::json!({"node_id": node_id, "cluster": cluster}),
            )
            .await;
        Ok(())
    }

    /// Record a heartbeat. The report must pass schema validation whole;
    /// a rejected report writes nothing.
    pub async fn heartbeat(&self, report: NodeHeartbeat) -> CoreResult<()> {
        if !validate_node_id(&report.node_id) {
            return Err(CoreError::Validation(format!(
                "invalid node id: {:?}",
                report.node_id
            )));
        }

        let node_id = report.node_id.clone();
        let payload = serde_json::to_string(&report)?;

        self.store
            .set_ex(&keys::heartbeat(&node_id), &payload, self.heartbeat_ttl)
            .await?;
        self.store.sadd(keys::NODES_ACTIVE, &node_id).await?;

        if let Some(power) = &report.power {
            let sample = PowerSample {
                timestamp: report.timestamp,
                total_w: power.total_w,
                gpu_w: power.gpu_w,
                cpu_w: power.cpu_w,
            };
            let key = keys::power_history(&node_id);
            self.store
                .lpush(&key, &serde_json::to_string(&sample)?)
                .await?;
            self.store
                .ltrim(&key, 0, keys::POWER_HISTORY_CAP - 1)
                .await?;
        }

        let sample = MetricSample {
            timestamp: report.timestamp,
            cpu_pct: report.system.cpu_pct,
            mem_pct: report.system.mem_pct,
            disk_pct: report.system.disk_pct,
            gpu_util_pct: report.avg_gpu_util(),
            power_w: report.power.as_ref().map(|p| p.total_w),
        };
        let samples_key = keys::metric_samples(&node_id);
        self.store
            .lpush(&samples_key, &serde_json::to_string(&sample)?)
            .await?;
        self.store
            .ltrim(&samples_key, 0, keys::METRIC_SAMPLES_CAP - 1)
            .await?;

        self.bus
            .node_metrics(&node_id, serde_json::to_value(&report)?)
            .await;
        Ok(())
    }

    /// Current snapshot for one node, or `None` if never seen.
    pub async fn get(&self, node_id: &str) -> CoreResult<Option<NodeView>> {
        let registration = self.read_registration(node_id).await;
        let heartbeat = self.read_heartbeat(node_id).await;
        if registration.is_none() && heartbeat.is_none() {
            return Ok(None);
        }
        Ok(Some(NodeView::from_parts(
            node_id.to_string(),
            registration,
            heartbeat,
        )))
    }

    /// List known nodes, optionally filtered by cluster and status.
    ///
    /// Active-set members whose heartbeat has expired and that carry no
    /// registration are dropped from the set here (passive GC).
    pub async fn list(
        &self,
        cluster: Option<&str>,
        status: Option<NodeStatus>,
    ) -> CoreResult<Vec<NodeView>> {
        let mut ids = self.store.smembers(keys::NODES_ACTIVE).await?;
        for id in self.store.smembers(keys::NODES_REGISTERED).await? {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        let mut views = Vec::with_capacity(ids.len());
        for id in ids {
            let heartbeat = self.read_heartbeat(&id).await;
            let registration = self.read_registration(&id).await;

            if heartbeat.is_none() {
                // Expired member: lazily remove from the active set. A
                // registered node stays listable as offline.
                self.store.srem(keys::NODES_ACTIVE, &id).await?;
                if registration.is_none() {
                    continue;
                }
            }

            let view = NodeView::from_parts(id, registration, heartbeat);
            if let Some(wanted) = cluster
                && view.cluster.as_deref() != Some(wanted)
            {
                continue;
            }
            if let Some(wanted) = status
                && view.status != wanted
            {
                continue;
            }
            views.push(view);
        }
        views.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(views)
    }

    /// Remove every trace of a node.
    pub async fn deregister(&self, node_id: &str) -> CoreResult<()> {
        let cluster = self
            .read_registration(node_id)
            .await
            .and_then(|r| r.registration.cluster);

        self.store.delete(&keys::registration(node_id)).await?;
        self.store.delete(&keys::heartbeat(node_id)).await?;
        self.store.delete(&keys::power_history(node_id)).await?;
        self.store.delete(&keys::metric_samples(node_id)).await?;
        self.store.srem(keys::NODES_ACTIVE, node_id).await?;
        self.store.srem(keys::NODES_REGISTERED, node_id).await?;
        if let Some(cluster) = &cluster {
            self.store
                .srem(&keys::cluster_nodes(cluster), node_id)
                .await?;
        }

        info!(node = %node_id, "node deregistered");
        self.bus
            .fleet_event(
                "node_deregistered",
                serde_json::json!({"node_id": node_id}),
            )
            .await;
        Ok(())
    }

    /// Capped power-consumption history, newest first.
    pub async fn power_history(
        &self,
        node_id: &str,
        limit: usize,
    ) -> CoreResult<Vec<PowerSample>> {
        let limit = limit.min(keys::POWER_HISTORY_CAP as usize);
        let raw = self
            .store
            .lrange(&keys::power_history(node_id), 0, limit as i64 - 1)
            .await?;
        let mut samples = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str(&entry) {
                Ok(sample) => samples.push(sample),
                Err(e) => warn!(node = %node_id, error = %e, "skipping corrupt power sample"),
            }
        }
        Ok(samples)
    }

    /// Fleet-wide aggregate over live heartbeats.
    pub async fn fleet_summary(&self) -> CoreResult<FleetSummary> {
        let views = self.list(None, None).await?;
        let mut summary = FleetSummary {
            active_nodes: 0,
            computing_nodes: 0,
            total_power_w: 0.0,
            total_gpu_power_w: 0.0,
            clusters: HashMap::new(),
            generated_at: Utc::now(),
        };

        for view in &views {
            let Some(hb) = &view.heartbeat else { continue };
            summary.active_nodes += 1;
            if let Some(activity) = &hb.activity
                && activity.status == "computing"
            {
                summary.computing_nodes += 1;
            }
            if let Some(power) = &hb.power {
                summary.total_power_w += power.total_w;
                summary.total_gpu_power_w += power.gpu_w;
            }
            if let Some(cluster) = &view.cluster {
                *summary.clusters.entry(cluster.clone()).or_insert(0) += 1;
            }
        }
        Ok(summary)
    }

    async fn read_heartbeat(&self, node_id: &str) -> Option<NodeHeartbeat> {
        let raw = self.store.get(&keys::heartbeat(node_id)).await.ok()??;
        match serde_json::from_str(&raw) {
            Ok(hb) => Some(hb),
            Err(e) => {
                warn!(node = %node_id, error = %e, "corrupt heartbeat record");
                None
            }
        }
    }

    async fn read_registration(&self, node_id: &str) -> Option<RegisteredNode> {
        let raw = self.store.get(&keys::registration(node_id)).await.ok()??;
        serde_json::from_str(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_proto::{ActivityStat, PowerStat, SystemStat};
    use muster_store::MemoryStore;

    fn registry() -> (NodeRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(store.clone());
        (NodeRegistry::new(store.clone(), bus), store)
    }

    fn registration(node_id: &str, cluster: &str) -> NodeRegistration {
        NodeRegistration {
            node_id: node_id.to_string(),
            hostname: node_id.to_string(),
            ip: "10.0.0.10".to_string(),
            platform: "linux".to_string(),
            cluster: Some(cluster.to_string()),
            gpu_name: Some("Orin".to_string()),
            gpu_memory_mb: Some(32768),
            gpu_count: Some(1),
            agent_port: Some(9100),
            agent_version: Some("1.0.0".to_string()),
            capabilities: vec!["gpu".to_string(), "docker".to_string()],
        }
    }

    fn heartbeat(node_id: &str) -> NodeHeartbeat {
        NodeHeartbeat {
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
            ip: Some("10.0.0.10".to_string()),
            cluster: Some("vision".to_string()),
            status: Some(NodeStatus::Online),
            system: SystemStat {
                cpu_pct: 20.0,
                mem_pct: 45.0,
                disk_pct: 60.0,
                disk_free_gb: 100.0,
                uptime_s: 3600,
                load_avg: [0.5, 0.4, 0.3],
            },
            gpus: vec![],
            power: Some(PowerStat {
                total_w: 40.0,
                gpu_w: 25.0,
                cpu_w: 10.0,
            }),
            activity: Some(ActivityStat {
                status: "computing".to_string(),
                containers: 1,
            }),
            containers: vec![],
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (registry, store) = registry();
        registry
            .register(registration("agx-01", "vision"))
            .await
            .unwrap();
        registry
            .register(registration("agx-01", "vision"))
            .await
            .unwrap();

        assert!(store
            .sismember(keys::NODES_REGISTERED, "agx-01")
            .await
            .unwrap());
        assert!(store
            .sismember(&keys::cluster_nodes("vision"), "agx-01")
            .await
            .unwrap());
        let view = registry.get("agx-01").await.unwrap().expect("view");
        assert_eq!(view.cluster.as_deref(), Some("vision"));
    }

    #[tokio::test]
    async fn test_register_rejects_bad_id() {
        let (registry, _) = registry();
        let err = registry
            .register(registration("bad id", "vision"))
            .await
            .expect_err("validation");
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_heartbeat_derives_online_status() {
        let (registry, _) = registry();
        registry.heartbeat(heartbeat("agx-01")).await.unwrap();

        let view = registry.get("agx-01").await.unwrap().expect("view");
        assert_eq!(view.status, NodeStatus::Online);
        assert!(view.heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_liveness_follows_heartbeat_ttl() {
        let (registry, store) = registry();
        let registry = registry.with_heartbeat_ttl(Duration::from_millis(40));

        registry.heartbeat(heartbeat("agx-01")).await.unwrap();
        assert_eq!(registry.list(None, None).await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        // Expired and unregistered: passive GC drops it entirely
        assert!(registry.list(None, None).await.unwrap().is_empty());
        assert!(!store.sismember(keys::NODES_ACTIVE, "agx-01").await.unwrap());
    }

    #[tokio::test]
    async fn test_registered_node_without_heartbeat_is_offline() {
        let (registry, store) = registry();
        let registry = registry.with_heartbeat_ttl(Duration::from_millis(40));

        registry
            .register(registration("agx-02", "vision"))
            .await
            .unwrap();
        registry.heartbeat(heartbeat("agx-02")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let views = registry.list(None, None).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].status, NodeStatus::Offline);
        // GC'd from active, still registered
        assert!(!store.sismember(keys::NODES_ACTIVE, "agx-02").await.unwrap());
        assert!(store
            .sismember(keys::NODES_REGISTERED, "agx-02")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (registry, _) = registry();
        let mut hb_llm = heartbeat("llm-01");
        hb_llm.cluster = Some("llm".to_string());
        registry.heartbeat(hb_llm).await.unwrap();
        registry.heartbeat(heartbeat("agx-01")).await.unwrap();

        let vision = registry.list(Some("vision"), None).await.unwrap();
        assert_eq!(vision.len(), 1);
        assert_eq!(vision[0].node_id, "agx-01");

        let online = registry.list(None, Some(NodeStatus::Online)).await.unwrap();
        assert_eq!(online.len(), 2);
        let offline = registry
            .list(None, Some(NodeStatus::Offline))
            .await
            .unwrap();
        assert!(offline.is_empty());
    }

    #[tokio::test]
    async fn test_deregister_removes_everything() {
        let (registry, store) = registry();
        registry
            .register(registration("agx-01", "vision"))
            .await
            .unwrap();
        registry.heartbeat(heartbeat("agx-01")).await.unwrap();

        registry.deregister("agx-01").await.unwrap();
        assert!(registry.get("agx-01").await.unwrap().is_none());
        assert!(!store.sismember(keys::NODES_ACTIVE, "agx-01").await.unwrap());
        assert!(!store
            .sismember(&keys::cluster_nodes("vision"), "agx-01")
            .await
            .unwrap());
        assert!(registry
            .power_history("agx-01", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_power_history_capped_and_newest_first() {
        let (registry, _) = registry();
        for n in 0..110 {
            let mut hb = heartbeat("agx-01");
            hb.power = Some(PowerStat {
                total_w: n as f32,
                gpu_w: 0.0,
                cpu_w: 0.0,
            });
            registry.heartbeat(hb).await.unwrap();
        }

        let history = registry.power_history("agx-01", 200).await.unwrap();
        assert_eq!(history.len(), keys::POWER_HISTORY_CAP as usize);
        assert_eq!(history[0].total_w, 109.0);
    }

    #[tokio::test]
    async fn test_fleet_summary() {
        let (registry, _) = registry();
        registry.heartbeat(heartbeat("agx-01")).await.unwrap();
        let mut idle = heartbeat("agx-02");
        idle.activity = Some(ActivityStat {
            status: "idle".to_string(),
            containers: 0,
        });
        registry.heartbeat(idle).await.unwrap();

        let summary = registry.fleet_summary().await.unwrap();
        assert_eq!(summary.active_nodes, 2);
        assert_eq!(summary.computing_nodes, 1);
        assert_eq!(summary.total_power_w, 80.0);
        assert_eq!(summary.clusters.get("vision"), Some(&2));
    }

    #[tokio::test]
    async fn test_heartbeat_publishes_metrics_event() {
        let (registry, store) = registry();
        let mut sub = store.psubscribe("metrics:*");
        registry.heartbeat(heartbeat("agx-01")).await.unwrap();

        let msg = sub.recv().await.expect("metrics event");
        assert_eq!(msg.channel, "metrics:agx-01");
    }
}
