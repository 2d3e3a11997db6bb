//! Shared key-value cache and per-user rate limiting.
//!
//! Keys are `ai:{namespace}:{parts…}`. Structured contexts are fingerprinted
//! with a stable digest (sorted-key JSON, SHA-256, first 12 hex chars) so
//! cache keys agree across processes. Store faults are swallowed: reads
//! degrade to misses, writes report failure, and the rate limiter fails
//! open. The backing store exposes the atomic get/setex/incr surface of a
//! shared cache server; the in-memory implementation covers single-node
//! deployments and tests.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::AiConfig;

const PREFIX: &str = "ai";
const FINGERPRINT_LEN: usize = 12;

// ── Backing store ───────────────────────────────────────────────────

/// Minimal atomic surface of the shared store. Implementations must make
/// each method individually atomic; cross-key transactions are not needed.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, ()>;
    fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ()>;
    /// Increment an integer counter, preserving its current expiry.
    fn incr(&self, key: &str) -> Result<i64, ()>;
    fn delete(&self, key: &str) -> Result<(), ()>;
}

/// Thread-safe in-memory store with lazy expiry, pruned on read.
pub struct MemoryKv {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, ()> {
        let now = Instant::now();
        {
            let entries = self.entries.read().map_err(|_| ())?;
            match entries.get(key) {
                Some((value, expires)) if *expires > now => return Ok(Some(value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it
        let mut entries = self.entries.write().map_err(|_| ())?;
        if let Some((_, expires)) = entries.get(key) {
            if *expires <= now {
                entries.remove(key);
            }
        }
        Ok(None)
    }

    fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ()> {
        let mut entries = self.entries.write().map_err(|_| ())?;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    fn incr(&self, key: &str) -> Result<i64, ()> {
        let mut entries = self.entries.write().map_err(|_| ())?;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some((value, expires)) if *expires > now => {
                let next = value.parse::<i64>().unwrap_or(0) + 1;
                *value = next.to_string();
                Ok(next)
            }
            _ => {
                // Counter absent or expired: a bare incr gives it a long
                // default window; callers create counters via setex first.
                entries.insert(key.to_string(), ("1".into(), now + Duration::from_secs(3600)));
                Ok(1)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<(), ()> {
        let mut entries = self.entries.write().map_err(|_| ())?;
        entries.remove(key);
        Ok(())
    }
}

/// A store that always fails, for exercising the degradation paths.
#[cfg(test)]
pub struct BrokenKv;

#[cfg(test)]
impl KvStore for BrokenKv {
    fn get(&self, _: &str) -> Result<Option<String>, ()> {
        Err(())
    }
    fn setex(&self, _: &str, _: &str, _: Duration) -> Result<(), ()> {
        Err(())
    }
    fn incr(&self, _: &str) -> Result<i64, ()> {
        Err(())
    }
    fn delete(&self, _: &str) -> Result<(), ()> {
        Err(())
    }
}

// ── Fingerprinting ──────────────────────────────────────────────────

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Stable short digest over a structured context, usable as a cache key part.
pub fn fingerprint(context: &Value) -> String {
    let canonical = canonicalize(context).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..FINGERPRINT_LEN].to_string()
}

// ── Cache ───────────────────────────────────────────────────────────

pub struct AiCache {
    kv: Box<dyn KvStore>,
    ttl_suggestions: Duration,
    ttl_anomalies: Duration,
    ttl_user_context: Duration,
    ttl_forecasts: Duration,
    requests_per_minute: i64,
    requests_per_hour: i64,
}

impl AiCache {
    pub fn new(kv: Box<dyn KvStore>, cfg: &AiConfig) -> Self {
        Self {
            kv,
            ttl_suggestions: cfg.cache_ttl_suggestions,
            ttl_anomalies: cfg.cache_ttl_anomalies,
            ttl_user_context: cfg.cache_ttl_user_context,
            ttl_forecasts: cfg.cache_ttl_forecasts,
            requests_per_minute: cfg.requests_per_minute,
            requests_per_hour: cfg.requests_per_hour,
        }
    }

    pub fn in_memory(cfg: &AiConfig) -> Self {
        Self::new(Box::new(MemoryKv::new()), cfg)
    }

    fn make_key(parts: &[&str]) -> String {
        format!("{PREFIX}:{}", parts.join(":"))
    }

    fn get_json(&self, key: &str) -> Option<Value> {
        match self.kv.get(key) {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            _ => None,
        }
    }

    fn set_json(&self, key: &str, value: &Value, ttl: Duration) -> bool {
        self.kv.setex(key, &value.to_string(), ttl).is_ok()
    }

    // ── Suggestions ──

    pub fn get_suggestions(&self, user_id: i64, context: &Value) -> Option<Value> {
        let key = Self::make_key(&["suggestions", &user_id.to_string(), &fingerprint(context)]);
        self.get_json(&key)
    }

    pub fn set_suggestions(&self, user_id: i64, context: &Value, result: &Value) -> bool {
        let key = Self::make_key(&["suggestions", &user_id.to_string(), &fingerprint(context)]);
        self.set_json(&key, result, self.ttl_suggestions)
    }

    // ── Anomalies ──

    pub fn get_anomalies(&self, date: &str, user_id: Option<i64>) -> Option<Value> {
        let subject = user_id.map_or_else(|| "all".to_string(), |id| id.to_string());
        self.get_json(&Self::make_key(&["anomalies", date, &subject]))
    }

    pub fn set_anomalies(&self, date: &str, user_id: Option<i64>, result: &Value) -> bool {
        let subject = user_id.map_or_else(|| "all".to_string(), |id| id.to_string());
        self.set_json(
            &Self::make_key(&["anomalies", date, &subject]),
            result,
            self.ttl_anomalies,
        )
    }

    // ── User context ──

    pub fn get_user_context(&self, user_id: i64) -> Option<Value> {
        self.get_json(&Self::make_key(&["user_context", &user_id.to_string()]))
    }

    pub fn set_user_context(&self, user_id: i64, context: &Value) -> bool {
        self.set_json(
            &Self::make_key(&["user_context", &user_id.to_string()]),
            context,
            self.ttl_user_context,
        )
    }

    // ── Forecasts ──

    pub fn get_forecast(&self, forecast_type: &str, entity: &str) -> Option<Value> {
        self.get_json(&Self::make_key(&["forecast", forecast_type, entity]))
    }

    pub fn set_forecast(&self, forecast_type: &str, entity: &str, result: &Value) -> bool {
        self.set_json(
            &Self::make_key(&["forecast", forecast_type, entity]),
            result,
            self.ttl_forecasts,
        )
    }

    // ── Rate limiting ──

    /// Sliding windowed counter. First request in a window creates the
    /// counter with the window as its expiry; at the limit the call is
    /// rejected with the current count; otherwise the counter advances.
    /// Fails open on store trouble.
    pub fn check_rate_limit(&self, user_id: i64, window_minutes: u64) -> (bool, i64) {
        let key = Self::make_key(&[
            "ratelimit",
            &user_id.to_string(),
            &window_minutes.to_string(),
        ]);
        let limit = if window_minutes == 1 {
            self.requests_per_minute
        } else {
            self.requests_per_hour
        };

        let current = match self.kv.get(&key) {
            Ok(v) => v,
            Err(()) => return (true, 0),
        };

        match current {
            None => {
                let window = Duration::from_secs(window_minutes * 60);
                if self.kv.setex(&key, "1", window).is_err() {
                    return (true, 0);
                }
                (true, 1)
            }
            Some(raw) => {
                let count = raw.parse::<i64>().unwrap_or(0);
                if count >= limit {
                    return (false, count);
                }
                match self.kv.incr(&key) {
                    Ok(next) => (true, next),
                    Err(()) => (true, count + 1),
                }
            }
        }
    }

    /// Drop every cached value for one user (after admin mutations).
    pub fn invalidate_user(&self, user_id: i64) {
        let _ = self
            .kv
            .delete(&Self::make_key(&["user_context", &user_id.to_string()]));
    }
}
