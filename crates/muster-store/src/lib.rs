//! State store contract for the Muster control plane.
//!
//! Every component shares state exclusively through [`StateStore`]: keyed
//! strings with TTL, hashes, sets, sorted sets, lists, and best-effort
//! pub/sub. The store serializes concurrent operations per key; no cross-key
//! transactions exist, and none are assumed.
//!
//! [`MemoryStore`] is the in-process engine used by `musterd` and the test
//! suite. A networked backend can implement the same trait.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use muster_proto::CoreResult;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;

pub mod keys;
mod memory;

pub use memory::MemoryStore;

// ─── Pub/sub types ────────────────────────────────────────────────────────────

/// A message delivered to a channel or pattern subscriber.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// A live subscription handle.
///
/// Delivery is best-effort: a subscriber that falls behind loses the lagged
/// messages and keeps receiving from the current position. Consumers
/// reconcile through queries, not through replay.
pub struct Subscription {
    rx: broadcast::Receiver<PubSubMessage>,
    pattern: String,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<PubSubMessage>, pattern: String) -> Self {
        Self { rx, pattern }
    }

    /// Receive the next matching message, or `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if glob_match(&self.pattern, &msg.channel) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(pattern = %self.pattern, skipped, "subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll for a matching message.
    pub fn try_recv(&mut self) -> Option<PubSubMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) if glob_match(&self.pattern, &msg.channel) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

// ─── Store contract ───────────────────────────────────────────────────────────

/// The shared-state contract every core component is written against.
///
/// Per-key linearizability is guaranteed by the implementation; readers of
/// TTL-bounded keys observe expiry as absence.
#[async_trait]
pub trait StateStore: Send + Sync {
    // Strings
    async fn set(&self, key: &str, value: &str) -> CoreResult<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<()>;
    async fn get(&self, key: &str) -> CoreResult<Option<String>>;
    async fn delete(&self, key: &str) -> CoreResult<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<bool>;
    async fn incr_by(&self, key: &str, by: i64) -> CoreResult<i64>;

    // Hashes
    async fn hset(&self, key: &str, field: &str, value: &str) -> CoreResult<()>;
    async fn hget(&self, key: &str, field: &str) -> CoreResult<Option<String>>;
    async fn hgetall(&self, key: &str) -> CoreResult<HashMap<String, String>>;
    async fn hdel(&self, key: &str, field: &str) -> CoreResult<bool>;

    // Sets
    async fn sadd(&self, key: &str, member: &str) -> CoreResult<bool>;
    async fn srem(&self, key: &str, member: &str) -> CoreResult<bool>;
    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>>;
    async fn sismember(&self, key: &str, member: &str) -> CoreResult<bool>;
    async fn scard(&self, key: &str) -> CoreResult<u64>;

    // Sorted sets
    async fn zadd(&self, key: &str, score: f64, member: &str) -> CoreResult<()>;
    async fn zrem(&self, key: &str, member: &str) -> CoreResult<bool>;
    async fn zpop_min(&self, key: &str) -> CoreResult<Option<(String, f64)>>;
    async fn zcard(&self, key: &str) -> CoreResult<u64>;
    async fn zrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> CoreResult<Vec<(String, f64)>>;

    // Lists (FIFO convention: rpush to enqueue, lpop to dequeue)
    async fn lpush(&self, key: &str, value: &str) -> CoreResult<u64>;
    async fn rpush(&self, key: &str, value: &str) -> CoreResult<u64>;
    async fn lpop(&self, key: &str) -> CoreResult<Option<String>>;
    async fn rpop(&self, key: &str) -> CoreResult<Option<String>>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> CoreResult<Vec<String>>;
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> CoreResult<()>;
    async fn llen(&self, key: &str) -> CoreResult<u64>;
    /// Remove all occurrences of `value` from the list. Returns removed count.
    async fn lrem(&self, key: &str, value: &str) -> CoreResult<u64>;
    /// Atomically pop the head of the first non-empty list, honoring key order.
    async fn lpop_any(&self, keys: &[&str]) -> CoreResult<Option<(String, String)>>;

    // Pub/sub
    async fn publish(&self, channel: &str, payload: &str) -> CoreResult<u64>;
    fn subscribe(&self, channel: &str) -> Subscription;
    fn psubscribe(&self, pattern: &str) -> Subscription;

    // Enumeration
    async fn scan(&self, pattern: &str) -> CoreResult<Vec<String>>;
}

// ─── Glob matching ────────────────────────────────────────────────────────────

/// Minimal glob matcher: `*` matches any run of characters, everything else
/// is literal. This is the subset the channel patterns use.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}
