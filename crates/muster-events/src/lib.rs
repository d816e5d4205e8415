//! Event fan-out for the Muster control plane.
//!
//! Every state transition in the core publishes a typed [`EventEnvelope`]
//! onto a named store channel. Delivery is best-effort and fire-and-forget:
//! publishing never fails a hot path, and a disconnected subscriber simply
//! misses messages (consumers reconcile via queries on reconnect).

#![forbid(unsafe_code)]

use muster_proto::{CoreError, CoreResult, EventEnvelope, NodeCommand, NodeCommandResult};
use muster_store::{StateStore, keys};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// ─── Event Bus ────────────────────────────────────────────────────────────────

/// Publishes typed envelopes onto store channels.
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn StateStore>,
}

impl EventBus {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Publish an envelope on `channel`. Failures are logged and swallowed.
    pub async fn publish(&self, channel: &str, event_type: &str, data: serde_json::Value) {
        let envelope = EventEnvelope::new(event_type, data);
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                warn!(channel, event_type, error = %e, "failed to serialize event");
                return;
            }
        };
        match self.store.publish(channel, &payload).await {
            Ok(delivered) => {
                debug!(channel, event_type, delivered, "event published");
            }
            Err(e) => {
                warn!(channel, event_type, error = %e, "failed to publish event");
            }
        }
    }

    /// Fleet-wide state transition.
    pub async fn fleet_event(&self, event_type: &str, data: serde_json::Value) {
        self.publish(keys::CH_FLEET_EVENTS, event_type, data).await;
    }

    /// Operator-facing alert.
    pub async fn alert(&self, event_type: &str, data: serde_json::Value) {
        self.publish(keys::CH_ALERTS, event_type, data).await;
    }

    /// Doctor loop event (`problem_detected`, `action_completed`, ...).
    pub async fn doctor_event(&self, event_type: &str, data: serde_json::Value) {
        self.publish(keys::CH_DOCTOR_EVENTS, event_type, data).await;
    }

    /// Per-node metrics sample, fanned out to `metrics:<node_id>`.
    pub async fn node_metrics(&self, node_id: &str, data: serde_json::Value) {
        self.publish(&keys::ch_metrics(node_id), "metrics", data)
            .await;
    }
}

// ─── Command dispatch ─────────────────────────────────────────────────────────

/// Pushes commands to worker agents over their command channel and waits for
/// the matching result.
///
/// Workers hold a subscription on `commands:<node_id>`; results come back on
/// `command_results:<cmd_id>`. A worker that never answers surfaces as a
/// transient timeout, not a hang.
#[derive(Clone)]
pub struct CommandDispatcher {
    store: Arc<dyn StateStore>,
}

impl CommandDispatcher {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn dispatch(
        &self,
        node_id: &str,
        command: NodeCommand,
        timeout: Duration,
    ) -> CoreResult<NodeCommandResult> {
        // Subscribe before publishing so the result cannot slip past us.
        let mut results = self.store.subscribe(&keys::ch_command_results(&command.id));

        let payload = serde_json::to_string(&command)?;
        let delivered = self
            .store
            .publish(&keys::ch_commands(node_id), &payload)
            .await?;
        if delivered == 0 {
            return Err(CoreError::Transient(format!(
                "no agent subscribed on commands:{node_id}"
            )));
        }

        match tokio::time::timeout(timeout, results.recv()).await {
            Ok(Some(msg)) => Ok(serde_json::from_str(&msg.payload)?),
            Ok(None) => Err(CoreError::Transient(
                "command result channel closed".to_string(),
            )),
            Err(_) => Err(CoreError::Transient(format!(
                "command {} to {node_id} timed out",
                command.id
            ))),
        }
    }
}
