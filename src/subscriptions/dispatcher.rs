//! Periodic delivery of tag and popular subscriptions.

use crate::config::Config;
use crate::error::{ApiError, DispatchError};
use crate::services::Services;
use crate::subscriptions::format::{
    apply_filters, popular_item_text, popular_summary_text, select_image_url, tag_query,
    tag_update_text, DeliveryMode, OutboundMessage,
};
use crate::subscriptions::store::{PopularScale, SubscriptionGroup, SubscriptionStore};
use crate::types::{parse_posts, Post};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const DEFAULT_BATCH_LIMIT: u32 = 5;
const MAX_BATCH_LIMIT: u32 = 20;

/// Host primitive that pushes a message to a chat session.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, session: &str, message: OutboundMessage) -> anyhow::Result<()>;
}

/// Reachability check for media urls before they are attached to a message.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn is_accessible(&self, url: &str) -> bool;
}

/// Probes with `HEAD`, falling back to a one-byte ranged `GET` for hosts that
/// reject `HEAD`.
pub struct HttpMediaProbe {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpMediaProbe {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }
}

#[async_trait]
impl MediaProbe for HttpMediaProbe {
    async fn is_accessible(&self, url: &str) -> bool {
        let head = self.http.head(url).timeout(self.timeout).send().await;
        match head {
            Ok(res) if res.status().is_success() => true,
            Ok(res) if res.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED => self
                .http
                .get(url)
                .header(reqwest::header::RANGE, "bytes=0-0")
                .timeout(self.timeout)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false),
            Ok(res) => {
                debug!("media {} answered {}", url, res.status());
                false
            }
            Err(e) => {
                debug!("media {} unreachable: {}", url, e);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub round: u64,
    pub tag_messages: usize,
    pub popular_messages: usize,
    pub failed_sends: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
}

impl DeliveryReport {
    fn absorb(&mut self, other: DeliveryReport) {
        self.sent += other.sent;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PopularSubscribeOutcome {
    pub group: SubscriptionGroup,
    pub delivered: DeliveryReport,
}

/// A post chosen for delivery, with the media url when the mode needs one.
type Candidate = (Post, Option<String>);

pub struct Dispatcher {
    config: Config,
    services: Services,
    store: Arc<SubscriptionStore>,
    sender: Arc<dyn MessageSender>,
    probe: Arc<dyn MediaProbe>,
}

impl Dispatcher {
    pub fn new(
        config: Config,
        services: Services,
        store: Arc<SubscriptionStore>,
        sender: Arc<dyn MessageSender>,
        probe: Arc<dyn MediaProbe>,
    ) -> Self {
        Self {
            config,
            services,
            store,
            sender,
            probe,
        }
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    fn batch_limit(&self) -> usize {
        self.config
            .resolve_batch_limit(None, DEFAULT_BATCH_LIMIT, MAX_BATCH_LIMIT) as usize
    }

    fn retention(&self) -> u64 {
        self.config.subscriptions.dedupe_rounds
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::from_display(&self.config.display)
    }

    fn ensure_enabled(&self) -> Result<(), DispatchError> {
        if self.config.subscriptions.enabled {
            Ok(())
        } else {
            Err(DispatchError::Disabled)
        }
    }

    /// Loop until `stop` flips to true or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let interval = self.config.subscriptions.interval();
        info!("subscription dispatcher started, interval {:?}", interval);
        loop {
            if *stop.borrow() {
                break;
            }
            match self.run_cycle().await {
                Ok(report) => info!(
                    "subscription round {}: {} tag and {} popular messages, {} failed sends",
                    report.round, report.tag_messages, report.popular_messages, report.failed_sends
                ),
                Err(e) => error!("subscription cycle failed: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("subscription dispatcher stopped");
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, DispatchError> {
        self.run_cycle_at(chrono::Utc::now().timestamp()).await
    }

    /// One cycle: new round, tag dispatch, then popular dispatch. `now` is unix seconds.
    pub async fn run_cycle_at(&self, now: i64) -> Result<CycleReport, DispatchError> {
        let round = self.store.next_dedupe_round().await?;
        let mut report = CycleReport {
            round,
            ..CycleReport::default()
        };
        self.dispatch_tags(round, &mut report).await?;
        self.dispatch_popular(round, now, &mut report).await?;
        Ok(report)
    }

    pub async fn dispatch_tags(&self, round: u64, report: &mut CycleReport) -> Result<(), DispatchError> {
        let groups = self.store.list_groups().await?;
        for (group_id, group) in groups {
            let Some(session) = group.session_id.as_deref().filter(|s| !s.is_empty()) else {
                continue;
            };
            for (tag, sub) in &group.tags {
                match self
                    .dispatch_tag(&group_id, session, tag, sub.last_post_id, round)
                    .await
                {
                    Ok(delivered) => {
                        report.tag_messages += delivered.sent;
                        report.failed_sends += delivered.failed;
                    }
                    Err(e) => {
                        warn!("tag subscription {} for group {} failed: {}", tag, group_id, e);
                        report.errors.push(format!("{}:{}: {}", group_id, tag, e));
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch_tag(
        &self,
        group_id: &str,
        session: &str,
        tag: &str,
        last_post_id: Option<u64>,
        round: u64,
    ) -> Result<DeliveryReport, DispatchError> {
        let limit = self.batch_limit();
        let query = tag_query(&self.config.filter, tag, last_post_id);
        let response = self
            .services
            .posts
            .list(Some(&query), None, Some(limit as u32), false)
            .await?;
        let posts = parse_posts(&response.data);
        let Some(max_id) = posts.iter().map(|p| p.id).max() else {
            return Ok(DeliveryReport::default());
        };

        let candidates = self.select_candidates(&posts, limit).await;
        let fresh = self.claim(group_id, &candidates, round).await?;

        let mut delivered = DeliveryReport::default();
        // newest first from the API; deliver oldest first
        let ordered: Vec<Candidate> = fresh.into_iter().rev().collect();
        match self.mode() {
            DeliveryMode::ImageOnly => {
                let urls = ordered.iter().filter_map(|(_, url)| url.clone());
                if let Some(message) = OutboundMessage::images(urls) {
                    delivered.absorb(self.deliver(session, message).await);
                }
            }
            DeliveryMode::TextWithImage => {
                for (post, url) in &ordered {
                    let text = tag_update_text(tag, post, &self.config.display);
                    let Some(url) = url else { continue };
                    delivered.absorb(
                        self.deliver(session, OutboundMessage::text_with_image(text, url.clone()))
                            .await,
                    );
                }
            }
            DeliveryMode::TextOnly => {
                for (post, _) in &ordered {
                    let text = tag_update_text(tag, post, &self.config.display);
                    delivered.absorb(self.deliver(session, OutboundMessage::text(text)).await);
                }
            }
        }

        let watermark = last_post_id.unwrap_or(0).max(max_id);
        self.store.update_last_post(group_id, tag, watermark).await?;
        Ok(delivered)
    }

    pub async fn dispatch_popular(
        &self,
        round: u64,
        now: i64,
        report: &mut CycleReport,
    ) -> Result<(), DispatchError> {
        let groups = self.store.list_groups().await?;
        let cooldown = i64::try_from(self.config.subscriptions.interval().as_secs()).unwrap_or(i64::MAX);

        let mut buckets: BTreeMap<PopularScale, Vec<(String, String)>> = BTreeMap::new();
        for (group_id, group) in groups {
            let Some(session) = group.session_id.filter(|s| !s.is_empty()) else {
                continue;
            };
            if !group.popular.enabled {
                continue;
            }
            let last_sent = group.popular.last_sent;
            if last_sent > 0 && now.saturating_sub(last_sent) < cooldown {
                debug!("popular feed for {} is cooling down", group_id);
                continue;
            }
            buckets
                .entry(group.popular.scale)
                .or_default()
                .push((group_id, session));
        }

        for (scale, entries) in buckets {
            let response = match self
                .services
                .explore
                .popular(None, Some(scale.as_str()), false)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!("popular feed ({}) failed: {}", scale, e);
                    report.errors.push(format!("popular:{}: {}", scale, e));
                    continue;
                }
            };
            let posts = parse_posts(&response.data);
            let candidates = self.select_candidates(&posts, self.batch_limit()).await;

            for (group_id, session) in entries {
                match self
                    .deliver_popular(&group_id, &session, scale, &candidates, round)
                    .await
                {
                    Ok(delivered) => {
                        report.popular_messages += delivered.sent;
                        report.failed_sends += delivered.failed;
                    }
                    Err(e) => {
                        warn!("popular delivery for group {} failed: {}", group_id, e);
                        report.errors.push(format!("{}:popular: {}", group_id, e));
                    }
                }
                // recorded even when nothing was deliverable
                self.store.update_popular_sent(&group_id, now).await?;
            }
        }
        Ok(())
    }

    async fn deliver_popular(
        &self,
        group_id: &str,
        session: &str,
        scale: PopularScale,
        candidates: &[Candidate],
        round: u64,
    ) -> Result<DeliveryReport, DispatchError> {
        let fresh = self.claim(group_id, candidates, round).await?;
        let mut delivered = DeliveryReport::default();
        if fresh.is_empty() {
            return Ok(delivered);
        }
        match self.mode() {
            DeliveryMode::ImageOnly => {
                let urls = fresh.iter().filter_map(|(_, url)| url.clone());
                if let Some(message) = OutboundMessage::images(urls) {
                    delivered.absorb(self.deliver(session, message).await);
                }
            }
            DeliveryMode::TextWithImage => {
                let total = fresh.len();
                for (idx, (post, url)) in fresh.iter().enumerate() {
                    let Some(url) = url else { continue };
                    let text = popular_item_text(scale, idx + 1, total, post, &self.config.display);
                    delivered.absorb(
                        self.deliver(session, OutboundMessage::text_with_image(text, url.clone()))
                            .await,
                    );
                }
            }
            DeliveryMode::TextOnly => {
                let posts: Vec<Post> = fresh.into_iter().map(|(p, _)| p).collect();
                let text = popular_summary_text(scale, &posts);
                delivered.absorb(self.deliver(session, OutboundMessage::text(text)).await);
            }
        }
        Ok(delivered)
    }

    /// Up to `limit` posts; in media modes only those with a reachable url.
    async fn select_candidates(&self, posts: &[Post], limit: usize) -> Vec<Candidate> {
        if !self.mode().needs_media() {
            return posts.iter().take(limit).map(|p| (p.clone(), None)).collect();
        }
        let size = self.config.display.preview_size;
        let mut selected = Vec::new();
        for post in posts {
            let Some(url) = select_image_url(post, size) else {
                continue;
            };
            if !self.probe.is_accessible(url).await {
                debug!("skipping post {}: media not reachable", post.id);
                continue;
            }
            selected.push((post.clone(), Some(url.to_string())));
            if selected.len() >= limit {
                break;
            }
        }
        selected
    }

    /// Keep the candidates not yet sent to this group and record them as sent.
    async fn claim(
        &self,
        group_id: &str,
        candidates: &[Candidate],
        round: u64,
    ) -> Result<Vec<Candidate>, DispatchError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<u64> = candidates.iter().map(|(p, _)| p.id).collect();
        let fresh = self
            .store
            .claim_post_ids(group_id, &ids, round, self.retention())
            .await?;
        Ok(candidates
            .iter()
            .filter(|(p, _)| fresh.contains(&p.id))
            .cloned()
            .collect())
    }

    async fn deliver(&self, session: &str, message: OutboundMessage) -> DeliveryReport {
        match self.sender.send(session, message).await {
            Ok(()) => DeliveryReport { sent: 1, failed: 0 },
            Err(e) => {
                error!("failed to deliver subscription message to {}: {:#}", session, e);
                DeliveryReport { sent: 0, failed: 1 }
            }
        }
    }

    /// Subscribe a group to a tag. The watermark starts at the newest matching
    /// post so existing content is not replayed.
    pub async fn subscribe_tag(
        &self,
        group_id: &str,
        tag: &str,
        platform: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<SubscriptionGroup, DispatchError> {
        self.ensure_enabled()?;
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(ApiError::validation("tag must not be empty").into());
        }
        let group = self
            .store
            .subscribe_tag(group_id, tag, platform, session_id)
            .await?;

        let mut tokens = apply_filters(&self.config.filter, tag);
        tokens.push("order:id_desc".into());
        let query = tokens.join(" ");
        match self.services.posts.list(Some(&query), None, Some(1), false).await {
            Ok(response) => {
                if let Some(latest) = parse_posts(&response.data).first() {
                    let previous = group
                        .tags
                        .get(tag)
                        .and_then(|t| t.last_post_id)
                        .unwrap_or(0);
                    self.store
                        .update_last_post(group_id, tag, previous.max(latest.id))
                        .await?;
                }
            }
            Err(e) => warn!("could not initialize watermark for {}: {}", tag, e),
        }

        Ok(self.store.list_group(group_id).await?.unwrap_or(group))
    }

    pub async fn unsubscribe_tag(&self, group_id: &str, tag: &str) -> Result<bool, DispatchError> {
        self.ensure_enabled()?;
        Ok(self.store.unsubscribe_tag(group_id, tag.trim()).await?)
    }

    pub async fn subscribe_popular(
        &self,
        group_id: &str,
        platform: Option<&str>,
        session_id: Option<&str>,
        scale: PopularScale,
    ) -> Result<PopularSubscribeOutcome, DispatchError> {
        self.subscribe_popular_at(group_id, platform, session_id, scale, chrono::Utc::now().timestamp())
            .await
    }

    /// Enable the popular feed and send a first batch right away.
    pub async fn subscribe_popular_at(
        &self,
        group_id: &str,
        platform: Option<&str>,
        session_id: Option<&str>,
        scale: PopularScale,
        now: i64,
    ) -> Result<PopularSubscribeOutcome, DispatchError> {
        self.ensure_enabled()?;
        let group = self
            .store
            .set_popular(group_id, true, platform, session_id, Some(scale))
            .await?;

        let mut delivered = DeliveryReport::default();
        match self.services.explore.popular(None, Some(scale.as_str()), false).await {
            Ok(response) => {
                let posts = parse_posts(&response.data);
                let candidates = self.select_candidates(&posts, self.batch_limit()).await;
                if let Some(session) = group.session_id.as_deref().filter(|s| !s.is_empty()) {
                    let round = self.store.current_dedupe_round().await?;
                    delivered = self
                        .deliver_popular(group_id, session, scale, &candidates, round)
                        .await?;
                }
            }
            Err(e) => warn!("initial popular batch ({}) failed: {}", scale, e),
        }
        self.store.update_popular_sent(group_id, now).await?;

        let group = self.store.list_group(group_id).await?.unwrap_or(group);
        Ok(PopularSubscribeOutcome { group, delivered })
    }

    pub async fn unsubscribe_popular(&self, group_id: &str) -> Result<SubscriptionGroup, DispatchError> {
        self.ensure_enabled()?;
        Ok(self.store.set_popular(group_id, false, None, None, None).await?)
    }
}
