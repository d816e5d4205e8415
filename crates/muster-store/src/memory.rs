//! In-process store engine.
//!
//! Backs the [`StateStore`] contract with sharded maps behind a single
//! `parking_lot::RwLock`. TTL expiry is lazy: reads treat expired entries as
//! absent, writes purge them. Pub/sub rides one broadcast channel; pattern
//! filtering happens subscriber-side.

use crate::{PubSubMessage, StateStore, Subscription, glob_match};
use async_trait::async_trait;
use chrono::Utc;
use muster_proto::{CoreError, CoreResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const PUBSUB_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StringEntry {
    value: String,
    expires_at_ms: Option<i64>,
}

impl StringEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, Vec<(f64, String)>>,
    lists: HashMap<String, VecDeque<String>>,
}

impl Inner {
    fn purge_expired(&mut self, now_ms: i64) {
        self.strings.retain(|_, e| !e.is_expired(now_ms));
    }

    fn live_string(&self, key: &str, now_ms: i64) -> Option<&StringEntry> {
        self.strings.get(key).filter(|e| !e.is_expired(now_ms))
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Normalize a Redis-style inclusive range into vec indices.
fn norm_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// The process-embedded state store.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<PubSubMessage>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            events,
            snapshot_path: None,
        }
    }

    /// Create a store that can snapshot itself to `{path}`.
    ///
    /// Existing snapshot data is loaded; a corrupt or missing file starts
    /// fresh. Expired string entries are dropped at load time.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut inner = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<Inner>(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt store snapshot, starting fresh");
                Inner::default()
            }),
            Err(_) => {
                debug!(path = %path.display(), "no store snapshot, starting fresh");
                Inner::default()
            }
        };
        inner.purge_expired(now_ms());

        let (events, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            inner: RwLock::new(inner),
            events,
            snapshot_path: Some(path),
        }
    }

    /// Write the current contents to the snapshot path, if one is set.
    pub fn snapshot(&self) -> std::io::Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = {
            let mut inner = self.inner.write();
            inner.purge_expired(now_ms());
            serde_json::to_string_pretty(&*inner).map_err(std::io::Error::other)?
        };
        std::fs::write(path, content)
    }

    fn send(&self, channel: &str, payload: &str) -> u64 {
        let msg = PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        // No subscribers is not an error; fan-out is best-effort.
        self.events.send(msg).map(|n| n as u64).unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    // ── Strings ──────────────────────────────────────────────────────────────

    async fn set(&self, key: &str, value: &str) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at_ms: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at_ms: Some(now_ms() + ttl.as_millis() as i64),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let inner = self.inner.read();
        Ok(inner.live_string(key, now_ms()).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> CoreResult<bool> {
        let mut inner = self.inner.write();
        let removed = inner.strings.remove(key).is_some()
            | inner.hashes.remove(key).is_some()
            | inner.sets.remove(key).is_some()
            | inner.zsets.remove(key).is_some()
            | inner.lists.remove(key).is_some();
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<bool> {
        let mut inner = self.inner.write();
        let now = now_ms();
        match inner.strings.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at_ms = Some(now + ttl.as_millis() as i64);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr_by(&self, key: &str, by: i64) -> CoreResult<i64> {
        let mut inner = self.inner.write();
        let now = now_ms();
        let current = match inner.live_string(key, now) {
            Some(entry) => entry
                .value
                .parse::<i64>()
                .map_err(|_| CoreError::Validation(format!("key {key} is not an integer")))?,
            None => 0,
        };
        let next = current + by;
        let expires = inner.strings.get(key).and_then(|e| e.expires_at_ms);
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: next.to_string(),
                expires_at_ms: expires.filter(|at| *at > now),
            },
        );
        Ok(next)
    }

    // ── Hashes ───────────────────────────────────────────────────────────────

    async fn hset(&self, key: &str, field: &str, value: &str) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> CoreResult<Option<String>> {
        let inner = self.inner.read();
        Ok(inner.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hgetall(&self, key: &str) -> CoreResult<HashMap<String, String>> {
        let inner = self.inner.read();
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> CoreResult<bool> {
        let mut inner = self.inner.write();
        let Some(hash) = inner.hashes.get_mut(key) else {
            return Ok(false);
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            inner.hashes.remove(key);
        }
        Ok(removed)
    }

    // ── Sets ─────────────────────────────────────────────────────────────────

    async fn sadd(&self, key: &str, member: &str) -> CoreResult<bool> {
        let mut inner = self.inner.write();
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> CoreResult<bool> {
        let mut inner = self.inner.write();
        let Some(set) = inner.sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            inner.sets.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>> {
        let inner = self.inner.read();
        let mut members: Vec<String> = inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> CoreResult<bool> {
        let inner = self.inner.read();
        Ok(inner.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn scard(&self, key: &str) -> CoreResult<u64> {
        let inner = self.inner.read();
        Ok(inner.sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    // ── Sorted sets ──────────────────────────────────────────────────────────

    async fn zadd(&self, key: &str, score: f64, member: &str) -> CoreResult<()> {
        let mut inner = self.inner.write();
        let zset = inner.zsets.entry(key.to_string()).or_default();
        zset.retain(|(_, m)| m != member);
        let pos = zset.partition_point(|(s, m)| {
            *s < score || (*s == score && m.as_str() < member)
        });
        zset.insert(pos, (score, member.to_string()));
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> CoreResult<bool> {
        let mut inner = self.inner.write();
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        let before = zset.len();
        zset.retain(|(_, m)| m != member);
        let removed = zset.len() < before;
        if zset.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(removed)
    }

    async fn zpop_min(&self, key: &str) -> CoreResult<Option<(String, f64)>> {
        let mut inner = self.inner.write();
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(None);
        };
        if zset.is_empty() {
            return Ok(None);
        }
        let (score, member) = zset.remove(0);
        if zset.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(Some((member, score)))
    }

    async fn zcard(&self, key: &str) -> CoreResult<u64> {
        let inner = self.inner.read();
        Ok(inner.zsets.get(key).map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> CoreResult<Vec<(String, f64)>> {
        let inner = self.inner.read();
        let Some(zset) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let Some((lo, hi)) = norm_range(zset.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(zset[lo..=hi]
            .iter()
            .map(|(s, m)| (m.clone(), *s))
            .collect())
    }

    // ── Lists ────────────────────────────────────────────────────────────────

    async fn lpush(&self, key: &str, value: &str) -> CoreResult<u64> {
        let mut inner = self.inner.write();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len() as u64)
    }

    async fn rpush(&self, key: &str, value: &str) -> CoreResult<u64> {
        let mut inner = self.inner.write();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    async fn lpop(&self, key: &str) -> CoreResult<Option<String>> {
        let mut inner = self.inner.write();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(None);
        };
        let value = list.pop_front();
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(value)
    }

    async fn rpop(&self, key: &str) -> CoreResult<Option<String>> {
        let mut inner = self.inner.write();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(None);
        };
        let value = list.pop_back();
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(value)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> CoreResult<Vec<String>> {
        let inner = self.inner.read();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let Some((lo, hi)) = norm_range(list.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(list.iter().skip(lo).take(hi - lo + 1).cloned().collect())
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> CoreResult<()> {
        let mut inner = self.inner.write();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(());
        };
        match norm_range(list.len(), start, stop) {
            Some((lo, hi)) => {
                let kept: VecDeque<String> =
                    list.iter().skip(lo).take(hi - lo + 1).cloned().collect();
                *list = kept;
            }
            None => {
                inner.lists.remove(key);
            }
        }
        Ok(())
    }

    async fn llen(&self, key: &str) -> CoreResult<u64> {
        let inner = self.inner.read();
        Ok(inner.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn lrem(&self, key: &str, value: &str) -> CoreResult<u64> {
        let mut inner = self.inner.write();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|v| v != value);
        let removed = (before - list.len()) as u64;
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(removed)
    }

    async fn lpop_any(&self, keys: &[&str]) -> CoreResult<Option<(String, String)>> {
        let mut inner = self.inner.write();
        for key in keys {
            if let Some(list) = inner.lists.get_mut(*key)
                && let Some(value) = list.pop_front()
            {
                if list.is_empty() {
                    inner.lists.remove(*key);
                }
                return Ok(Some((key.to_string(), value)));
            }
        }
        Ok(None)
    }

    // ── Pub/sub ──────────────────────────────────────────────────────────────

    async fn publish(&self, channel: &str, payload: &str) -> CoreResult<u64> {
        Ok(self.send(channel, payload))
    }

    fn subscribe(&self, channel: &str) -> Subscription {
        Subscription::new(self.events.subscribe(), channel.to_string())
    }

    fn psubscribe(&self, pattern: &str) -> Subscription {
        Subscription::new(self.events.subscribe(), pattern.to_string())
    }

    // ── Enumeration ──────────────────────────────────────────────────────────

    async fn scan(&self, pattern: &str) -> CoreResult<Vec<String>> {
        let inner = self.inner.read();
        let now = now_ms();
        let mut keys: Vec<String> = inner
            .strings
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .chain(inner.hashes.keys().cloned())
            .chain(inner.sets.keys().cloned())
            .chain(inner.zsets.keys().cloned())
            .chain(inner.lists.keys().cloned())
            .filter(|k| glob_match(pattern, k))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

// Snapshot persistence needs access to snapshot paths from shared handles.
impl MemoryStore {
    /// Path this store snapshots to, if persistence is enabled.
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }
}
