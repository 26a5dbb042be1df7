use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClearStats {
    pub count: usize,
    pub size_bytes: usize,
}

/// TTL cache for GET payloads, bounded by entry count.
#[derive(Debug)]
pub struct ResponseCache {
    max_size: usize,
    default_ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

/// `METHOD:url[:k=v&k=v]` with params in key order.
pub fn cache_key(method: &str, url: &str, params: &BTreeMap<String, String>) -> String {
    let mut key = format!("{}:{}", method.to_uppercase(), url);
    if !params.is_empty() {
        let joined = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        key.push(':');
        key.push_str(&joined);
    }
    key
}

/// Longest lifetime an entry can get; larger TTLs are clamped.
const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(MAX_TTL))
        .unwrap_or(now)
}

impl ResponseCache {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            max_size,
            default_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        method: &str,
        url: &str,
        params: &BTreeMap<String, String>,
    ) -> Option<Value> {
        let key = cache_key(method, url, params);
        let mut entries = self.entries.lock().await;
        let entry = entries.get(&key)?;
        if Instant::now() < entry.expires_at {
            return Some(entry.value.clone());
        }
        entries.remove(&key);
        None
    }

    /// Store `value`; `ttl` of `None` uses the default, `Some(ZERO)` stores an expired entry.
    pub async fn set(
        &self,
        method: &str,
        url: &str,
        params: &BTreeMap<String, String>,
        value: Value,
        ttl: Option<Duration>,
    ) {
        if self.max_size == 0 {
            return;
        }
        let key = cache_key(method, url, params);
        let expires_at = expiry(Instant::now(), ttl.unwrap_or(self.default_ttl));
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_size && !entries.contains_key(&key) {
            Self::cleanup(&mut entries, self.max_size);
        }
        entries.insert(key, CacheEntry { value, expires_at });
    }

    fn cleanup(entries: &mut HashMap<String, CacheEntry>, max_size: usize) {
        let now = Instant::now();
        entries.retain(|_, e| now < e.expires_at);
        if entries.len() < max_size {
            return;
        }
        let mut by_expiry: Vec<(String, Instant)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.expires_at))
            .collect();
        by_expiry.sort_by_key(|(_, at)| *at);
        let excess = entries.len() - max_size + 1;
        for (key, _) in by_expiry.into_iter().take(excess) {
            entries.remove(&key);
        }
    }

    /// Empty pattern drops everything; otherwise drop keys containing `pattern`.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let mut entries = self.entries.lock().await;
        if pattern.is_empty() {
            let count = entries.len();
            entries.clear();
            return count;
        }
        let before = entries.len();
        entries.retain(|k, _| !k.contains(pattern));
        before - entries.len()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Empty the cache, reporting how much it held. The byte size is an estimate.
    pub async fn clear_with_stats(&self) -> ClearStats {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        let size_bytes = entries
            .iter()
            .map(|(k, e)| {
                let payload =
                    serde_json::to_string(&e.value).unwrap_or_else(|_| e.value.to_string());
                k.len() + payload.len()
            })
            .sum();
        entries.clear();
        ClearStats { count, size_bytes }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
