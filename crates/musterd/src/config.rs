//! Head process configuration.
//!
//! A JSON file provides the base; environment variables override individual
//! fields so container deployments never need to template the file.

use muster_proto::RiskLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_state_store_url() -> String {
    "memory://".to_string()
}

fn default_state_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".musterd")
}

fn default_ws_bind() -> String {
    "0.0.0.0:8766".to_string()
}

fn default_api_base() -> String {
    "http://localhost:8765".to_string()
}

fn default_heartbeat_ttl() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_llm_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "deepseek-coder:6.7b".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadConfig {
    #[serde(default = "default_state_store_url")]
    pub state_store_url: String,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_ws_bind")]
    pub ws_bind: String,
    /// Base URL of our own API surface, used by doctor remediation calls.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl_s: u64,

    #[serde(default = "default_true")]
    pub doctor_enabled: bool,
    #[serde(default)]
    pub doctor: muster_doctor::DoctorConfig,

    #[serde(default)]
    pub scaler_enabled: bool,
    #[serde(default)]
    pub scaler: muster_proto::ScalingConfig,

    #[serde(default = "default_llm_endpoint")]
    pub llm_endpoint: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
}

impl Default for HeadConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

impl HeadConfig {
    /// Load from a JSON file (missing file means defaults), then apply
    /// environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("config {}: {e}", path.display()))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Only the in-process engine ships today; refusing anything else at
    /// startup beats silently running with no shared state.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.state_store_url.starts_with("memory:") {
            anyhow::bail!(
                "unsupported state store url {:?} (expected memory://)",
                self.state_store_url
            );
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("STATE_STORE_URL") {
            self.state_store_url = v;
        }
        if let Ok(v) = std::env::var("MUSTER_STATE_PATH") {
            self.state_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MUSTER_WS_BIND") {
            self.ws_bind = v;
        }
        if let Ok(v) = std::env::var("HEARTBEAT_TTL_S")
            && let Ok(n) = v.parse()
        {
            self.heartbeat_ttl_s = n;
        }

        if let Ok(v) = std::env::var("DOCTOR_ENABLED") {
            self.doctor_enabled = v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("DOCTOR_INTERVAL_S")
            && let Ok(n) = v.parse()
        {
            self.doctor.interval_seconds = n;
        }
        if let Ok(v) = std::env::var("DOCTOR_AUTO_FIX_LEVELS") {
            let levels: Vec<RiskLevel> = v
                .split(',')
                .filter_map(|s| match s.trim() {
                    "low" => Some(RiskLevel::Low),
                    "medium" => Some(RiskLevel::Medium),
                    "high" => Some(RiskLevel::High),
                    _ => None,
                })
                .collect();
            if !levels.is_empty() {
                self.doctor.auto_fix_levels = levels;
            }
        }
        if let Ok(v) = std::env::var("DOCTOR_DISK_THRESHOLD")
            && let Ok(n) = v.parse()
        {
            self.doctor.detector.disk_warn_pct = n;
        }
        if let Ok(v) = std::env::var("DOCTOR_MAX_ACTIONS_PER_HOUR")
            && let Ok(n) = v.parse()
        {
            self.doctor.max_actions_per_hour = n;
        }

        if let Ok(v) = std::env::var("SCALER_ENABLED") {
            self.scaler_enabled = v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("SCALER_INTERVAL_S")
            && let Ok(n) = v.parse()
        {
            self.scaler.check_interval_seconds = n;
        }
        if let Ok(v) = std::env::var("SCALER_MIN_NODES")
            && let Ok(n) = v.parse()
        {
            self.scaler.min_nodes = n;
        }
        if let Ok(v) = std::env::var("SCALER_MAX_NODES")
            && let Ok(n) = v.parse()
        {
            self.scaler.max_nodes = n;
        }
        if let Ok(v) = std::env::var("SCALER_TARGET_DEPTH")
            && let Ok(n) = v.parse()
        {
            self.scaler.target_queue_depth = n;
        }
        if let Ok(v) = std::env::var("SCALER_COOLDOWN_S")
            && let Ok(n) = v.parse()
        {
            self.scaler.cooldown_seconds = n;
        }

        if let Ok(v) = std::env::var("LLM_ENDPOINT") {
            self.llm_endpoint = v;
        }
        if let Ok(v) = std::env::var("LLM_MODEL") {
            self.llm_model = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HeadConfig::default();
        assert_eq!(config.state_store_url, "memory://");
        assert_eq!(config.heartbeat_ttl_s, 120);
        assert!(config.doctor_enabled);
        assert!(!config.scaler_enabled);
        assert_eq!(config.doctor.interval_seconds, 30);
        assert_eq!(config.scaler.max_nodes, 16);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("musterd.json");

        let mut config = HeadConfig::default();
        config.ws_bind = "127.0.0.1:9999".to_string();
        config.scaler_enabled = true;
        config.save(&path).expect("save");

        let loaded = HeadConfig::load(&path).expect("load");
        assert_eq!(loaded.ws_bind, "127.0.0.1:9999");
        assert!(loaded.scaler_enabled);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = HeadConfig::load(&dir.path().join("nope.json")).expect("defaults");
        assert_eq!(config.state_store_url, "memory://");
    }

    #[test]
    fn test_validate_rejects_unknown_store() {
        let mut config = HeadConfig::default();
        config.state_store_url = "redis://elsewhere:6379".to_string();
        assert!(config.validate().is_err());
    }
}
