//! Durable per-group subscription state.
//!
//! Key layout in the backing store:
//!
//! ```text
//! group:<group_id>     -> SubscriptionGroup JSON
//! sent:<group_id>      -> {post_id: round} dedup ledger
//! meta:dedupe_round    -> u64 round counter
//! ```

use crate::error::StoreError;
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const GROUP_PREFIX: &str = "group:";
const SENT_PREFIX: &str = "sent:";
const ROUND_KEY: &str = "meta:dedupe_round";

/// Host-provided async key/value store scoped to this plugin.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;
    /// All entries whose key starts with `prefix`, in key order.
    async fn range_get(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn range_get(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Whole-file JSON store. Every `put` rewrites the file through a temp file + rename.
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl FileKvStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.persist(&entries).await
    }

    async fn range_get(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Time window of the popular feed. Unknown stored values read back as `Day`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum PopularScale {
    #[default]
    Day,
    Week,
    Month,
}

impl PopularScale {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    /// Strict parse for user input.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            _ => None,
        }
    }
}

impl From<String> for PopularScale {
    fn from(raw: String) -> Self {
        Self::parse(&raw).unwrap_or_default()
    }
}

impl std::fmt::Display for PopularScale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TagSubscription {
    /// Highest post id already seen for this tag; `None` until the first poll.
    #[serde(default)]
    pub last_post_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PopularSubscription {
    pub enabled: bool,
    /// Unix seconds; 0 means never sent.
    pub last_sent: i64,
    pub scale: PopularScale,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionGroup {
    pub group_id: String,
    pub platform: Option<String>,
    pub session_id: Option<String>,
    pub tags: BTreeMap<String, TagSubscription>,
    pub popular: PopularSubscription,
}

impl SubscriptionGroup {
    fn new(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            ..Self::default()
        }
    }
}

/// post id -> round in which it was sent.
type SentLedger = BTreeMap<u64, u64>;

fn is_active(sent_round: u64, round: u64, retention: u64) -> bool {
    retention > 0 && round.saturating_sub(sent_round) < retention
}

fn unique(ids: &[u64]) -> Vec<u64> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Typed access to subscription records. Every read-modify-write runs under
/// one in-process lock; returned records are owned snapshots.
pub struct SubscriptionStore {
    kv: Arc<dyn KvStore>,
    lock: Mutex<()>,
}

impl SubscriptionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            lock: Mutex::new(()),
        }
    }

    fn group_key(group_id: &str) -> String {
        format!("{}{}", GROUP_PREFIX, group_id)
    }

    fn sent_key(group_id: &str) -> String {
        format!("{}{}", SENT_PREFIX, group_id)
    }

    async fn load_group(&self, group_id: &str) -> Result<Option<SubscriptionGroup>, StoreError> {
        match self.kv.get(&Self::group_key(group_id)).await? {
            Some(Value::Null) | None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
        }
    }

    async fn save_group(&self, group: &SubscriptionGroup) -> Result<(), StoreError> {
        self.kv
            .put(&Self::group_key(&group.group_id), serde_json::to_value(group)?)
            .await
    }

    /// Load or create the record, refreshing routing info when given.
    async fn ensure_group(
        &self,
        group_id: &str,
        platform: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<SubscriptionGroup, StoreError> {
        let mut group = self
            .load_group(group_id)
            .await?
            .unwrap_or_else(|| SubscriptionGroup::new(group_id));
        group.group_id = group_id.to_string();
        if let Some(p) = platform.filter(|p| !p.is_empty()) {
            group.platform = Some(p.to_string());
        }
        if let Some(s) = session_id.filter(|s| !s.is_empty()) {
            group.session_id = Some(s.to_string());
        }
        Ok(group)
    }

    /// Idempotent: an existing tag keeps its watermark.
    pub async fn subscribe_tag(
        &self,
        group_id: &str,
        tag: &str,
        platform: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<SubscriptionGroup, StoreError> {
        let _guard = self.lock.lock().await;
        let mut group = self.ensure_group(group_id, platform, session_id).await?;
        group.tags.entry(tag.to_string()).or_default();
        self.save_group(&group).await?;
        Ok(group)
    }

    pub async fn unsubscribe_tag(&self, group_id: &str, tag: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let Some(mut group) = self.load_group(group_id).await? else {
            return Ok(false);
        };
        if group.tags.remove(tag).is_none() {
            return Ok(false);
        }
        self.save_group(&group).await?;
        Ok(true)
    }

    pub async fn update_last_post(
        &self,
        group_id: &str,
        tag: &str,
        post_id: u64,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut group = self.ensure_group(group_id, None, None).await?;
        group.tags.entry(tag.to_string()).or_default().last_post_id = Some(post_id);
        self.save_group(&group).await
    }

    pub async fn set_popular(
        &self,
        group_id: &str,
        enabled: bool,
        platform: Option<&str>,
        session_id: Option<&str>,
        scale: Option<PopularScale>,
    ) -> Result<SubscriptionGroup, StoreError> {
        let _guard = self.lock.lock().await;
        let mut group = self.ensure_group(group_id, platform, session_id).await?;
        group.popular.enabled = enabled;
        if let Some(scale) = scale {
            group.popular.scale = scale;
        }
        self.save_group(&group).await?;
        Ok(group)
    }

    pub async fn update_popular_sent(&self, group_id: &str, timestamp: i64) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut group = self.ensure_group(group_id, None, None).await?;
        group.popular.last_sent = timestamp;
        self.save_group(&group).await
    }

    /// Every stored group keyed by id. Malformed records are skipped.
    pub async fn list_groups(&self) -> Result<BTreeMap<String, SubscriptionGroup>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut groups = BTreeMap::new();
        for (key, value) in self.kv.range_get(GROUP_PREFIX).await? {
            let Some(group_id) = key.strip_prefix(GROUP_PREFIX) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            match serde_json::from_value::<SubscriptionGroup>(value) {
                Ok(mut group) => {
                    group.group_id = group_id.to_string();
                    groups.insert(group_id.to_string(), group);
                }
                Err(e) => warn!("skipping malformed subscription record {}: {}", key, e),
            }
        }
        Ok(groups)
    }

    pub async fn list_group(&self, group_id: &str) -> Result<Option<SubscriptionGroup>, StoreError> {
        let _guard = self.lock.lock().await;
        self.load_group(group_id).await
    }

    async fn load_round(&self) -> Result<u64, StoreError> {
        Ok(self
            .kv
            .get(ROUND_KEY)
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }

    /// Advance and persist the round counter; called once per dispatch cycle.
    pub async fn next_dedupe_round(&self) -> Result<u64, StoreError> {
        let _guard = self.lock.lock().await;
        let next = self.load_round().await?.saturating_add(1);
        self.kv.put(ROUND_KEY, Value::from(next)).await?;
        Ok(next)
    }

    pub async fn current_dedupe_round(&self) -> Result<u64, StoreError> {
        let _guard = self.lock.lock().await;
        self.load_round().await
    }

    async fn load_ledger(&self, group_id: &str) -> Result<SentLedger, StoreError> {
        match self.kv.get(&Self::sent_key(group_id)).await? {
            Some(Value::Null) | None => Ok(SentLedger::new()),
            Some(v) => match serde_json::from_value(v) {
                Ok(ledger) => Ok(ledger),
                Err(e) => {
                    warn!("resetting malformed sent ledger for {}: {}", group_id, e);
                    Ok(SentLedger::new())
                }
            },
        }
    }

    fn filter_with(ledger: &SentLedger, ids: &[u64], round: u64, retention: u64) -> Vec<u64> {
        unique(ids)
            .into_iter()
            .filter(|id| {
                !ledger
                    .get(id)
                    .is_some_and(|sent| is_active(*sent, round, retention))
            })
            .collect()
    }

    async fn mark_locked(
        &self,
        group_id: &str,
        mut ledger: SentLedger,
        ids: &[u64],
        round: u64,
        retention: u64,
    ) -> Result<(), StoreError> {
        ledger.retain(|_, sent| is_active(*sent, round, retention));
        for id in ids {
            ledger.insert(*id, round);
        }
        self.kv
            .put(&Self::sent_key(group_id), serde_json::to_value(&ledger)?)
            .await
    }

    /// Ids not sent to this group within the last `retention` rounds, in input
    /// order without duplicates. `retention == 0` lets everything through.
    pub async fn filter_new_post_ids(
        &self,
        group_id: &str,
        ids: &[u64],
        round: u64,
        retention: u64,
    ) -> Result<Vec<u64>, StoreError> {
        if retention == 0 {
            return Ok(unique(ids));
        }
        let _guard = self.lock.lock().await;
        let ledger = self.load_ledger(group_id).await?;
        Ok(Self::filter_with(&ledger, ids, round, retention))
    }

    /// Record ids as sent in `round`, pruning entries that fell out of the window.
    pub async fn mark_sent_post_ids(
        &self,
        group_id: &str,
        ids: &[u64],
        round: u64,
        retention: u64,
    ) -> Result<(), StoreError> {
        if retention == 0 || ids.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let ledger = self.load_ledger(group_id).await?;
        self.mark_locked(group_id, ledger, ids, round, retention).await
    }

    /// Filter and mark in one step; the returned ids are now recorded as sent.
    pub async fn claim_post_ids(
        &self,
        group_id: &str,
        ids: &[u64],
        round: u64,
        retention: u64,
    ) -> Result<Vec<u64>, StoreError> {
        if retention == 0 {
            return Ok(unique(ids));
        }
        let _guard = self.lock.lock().await;
        let ledger = self.load_ledger(group_id).await?;
        let fresh = Self::filter_with(&ledger, ids, round, retention);
        if !fresh.is_empty() {
            self.mark_locked(group_id, ledger, &fresh, round, retention)
                .await?;
        }
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (Arc<MemoryKvStore>, SubscriptionStore) {
        let kv = Arc::new(MemoryKvStore::new());
        (kv.clone(), SubscriptionStore::new(kv))
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_keeps_watermark() {
        let (_, s) = store();
        let g = s.subscribe_tag("g1", "cat", Some("qq"), Some("sess")).await.unwrap();
        assert_eq!(g.tags["cat"].last_post_id, None);
        assert!(!g.popular.enabled);
        assert_eq!(g.popular.scale, PopularScale::Day);

        s.update_last_post("g1", "cat", 42).await.unwrap();
        let g = s.subscribe_tag("g1", "cat", None, None).await.unwrap();
        assert_eq!(g.tags["cat"].last_post_id, Some(42));
        assert_eq!(g.session_id.as_deref(), Some("sess"));
        assert_eq!(g.platform.as_deref(), Some("qq"));
    }

    #[tokio::test]
    async fn unsubscribe_reports_existence() {
        let (_, s) = store();
        assert!(!s.unsubscribe_tag("g1", "cat").await.unwrap());
        s.subscribe_tag("g1", "cat", None, Some("sess")).await.unwrap();
        assert!(s.unsubscribe_tag("g1", "cat").await.unwrap());
        assert!(!s.unsubscribe_tag("g1", "cat").await.unwrap());
        assert!(s.list_group("g1").await.unwrap().unwrap().tags.is_empty());
    }

    #[tokio::test]
    async fn partial_records_are_completed_on_read() {
        let (kv, s) = store();
        kv.put("group:old", json!({"session_id": "s", "popular": {"enabled": true, "scale": "year"}}))
            .await
            .unwrap();
        kv.put("group:bad", json!("garbage")).await.unwrap();
        kv.put("other:key", json!({})).await.unwrap();
        let groups = s.list_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        let old = &groups["old"];
        assert_eq!(old.group_id, "old");
        assert!(old.tags.is_empty());
        assert!(old.popular.enabled);
        assert_eq!(old.popular.scale, PopularScale::Day);
        assert_eq!(old.popular.last_sent, 0);
    }

    #[tokio::test]
    async fn popular_toggle_and_sent_time() {
        let (_, s) = store();
        let g = s
            .set_popular("g1", true, None, Some("sess"), Some(PopularScale::Week))
            .await
            .unwrap();
        assert!(g.popular.enabled);
        s.update_popular_sent("g1", 1_700_000_000).await.unwrap();
        let g = s.set_popular("g1", false, None, None, None).await.unwrap();
        assert!(!g.popular.enabled);
        assert_eq!(g.popular.scale, PopularScale::Week);
        assert_eq!(g.popular.last_sent, 1_700_000_000);
    }

    #[tokio::test]
    async fn snapshots_do_not_alias_storage() {
        let (_, s) = store();
        s.subscribe_tag("g1", "cat", None, Some("sess")).await.unwrap();
        let mut snapshot = s.list_group("g1").await.unwrap().unwrap();
        snapshot.tags.clear();
        assert_eq!(s.list_group("g1").await.unwrap().unwrap().tags.len(), 1);
    }

    #[tokio::test]
    async fn rounds_are_monotonic() {
        let (_, s) = store();
        assert_eq!(s.current_dedupe_round().await.unwrap(), 0);
        assert_eq!(s.next_dedupe_round().await.unwrap(), 1);
        assert_eq!(s.next_dedupe_round().await.unwrap(), 2);
        assert_eq!(s.current_dedupe_round().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn ledger_is_per_group_and_expires() {
        let (_, s) = store();
        let claimed = s.claim_post_ids("g1", &[1, 2, 2, 3], 1, 2).await.unwrap();
        assert_eq!(claimed, vec![1, 2, 3]);
        assert!(s.claim_post_ids("g1", &[1, 2, 3], 1, 2).await.unwrap().is_empty());
        // other groups are unaffected
        assert_eq!(s.claim_post_ids("g2", &[1], 1, 2).await.unwrap(), vec![1]);
        // still inside the window one round later
        assert_eq!(s.filter_new_post_ids("g1", &[1, 4], 2, 2).await.unwrap(), vec![4]);
        // two rounds later the entries have aged out
        assert_eq!(s.filter_new_post_ids("g1", &[1, 4], 3, 2).await.unwrap(), vec![1, 4]);
    }

    #[tokio::test]
    async fn zero_retention_disables_dedup() {
        let (kv, s) = store();
        s.mark_sent_post_ids("g1", &[1], 1, 0).await.unwrap();
        assert!(kv.get("sent:g1").await.unwrap().is_none());
        assert_eq!(s.claim_post_ids("g1", &[1, 1], 1, 0).await.unwrap(), vec![1]);
        assert_eq!(s.claim_post_ids("g1", &[1], 1, 0).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn marking_prunes_stale_entries() {
        let (kv, s) = store();
        s.mark_sent_post_ids("g1", &[1, 2], 1, 2).await.unwrap();
        s.mark_sent_post_ids("g1", &[3], 5, 2).await.unwrap();
        assert_eq!(kv.get("sent:g1").await.unwrap(), Some(json!({"3": 5})));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("subs.json");
        {
            let s = SubscriptionStore::new(Arc::new(FileKvStore::open(&path).await.unwrap()));
            s.subscribe_tag("g1", "cat", None, Some("sess")).await.unwrap();
            s.update_last_post("g1", "cat", 7).await.unwrap();
            s.next_dedupe_round().await.unwrap();
        }
        let s = SubscriptionStore::new(Arc::new(FileKvStore::open(&path).await.unwrap()));
        let g = s.list_group("g1").await.unwrap().unwrap();
        assert_eq!(g.tags["cat"].last_post_id, Some(7));
        assert_eq!(s.current_dedupe_round().await.unwrap(), 1);
    }
}
