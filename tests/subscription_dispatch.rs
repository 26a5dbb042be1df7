use async_trait::async_trait;
use danbooru_bridge::config::Config;
use danbooru_bridge::events::NullSink;
use danbooru_bridge::subscriptions::{
    MediaProbe, MemoryKvStore, MessageSender, OutboundMessage, PopularScale,
};
use danbooru_bridge::{DispatchError, Plugin};
use httpmock::{Method::GET, MockServer};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(String, OutboundMessage)>>,
    fail: bool,
}

impl Outbox {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn taken(&self) -> Vec<(String, OutboundMessage)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl MessageSender for Outbox {
    async fn send(&self, session: &str, message: OutboundMessage) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("transport closed");
        }
        self.sent
            .lock()
            .unwrap()
            .push((session.to_string(), message));
        Ok(())
    }
}

struct Reachable;

#[async_trait]
impl MediaProbe for Reachable {
    async fn is_accessible(&self, _url: &str) -> bool {
        true
    }
}

fn config(base_url: &str, show_preview: bool) -> Config {
    Config::from_value(json!({
        "api": {
            "base_url": base_url,
            "max_retries": 2,
            "retry_delay": 0.01,
            "rate_limit_per_second": 100.0
        },
        "filter": {"allowed_ratings": ["g", "s", "q", "e"]},
        "display": {"show_preview": show_preview, "search_limit": 5, "show_tags": false}
    }))
    .unwrap()
}

/// Reports the listed urls as unreachable.
struct Blocked(Vec<String>);

#[async_trait]
impl MediaProbe for Blocked {
    async fn is_accessible(&self, url: &str) -> bool {
        !self.0.iter().any(|u| u == url)
    }
}

fn plugin_with(cfg: Config, outbox: Arc<Outbox>) -> Plugin {
    plugin_with_media(cfg, outbox, Arc::new(Reachable))
}

fn plugin_with_media(cfg: Config, outbox: Arc<Outbox>, media: Arc<dyn MediaProbe>) -> Plugin {
    Plugin::initialize_with_probe(
        cfg,
        Arc::new(MemoryKvStore::new()),
        outbox,
        media,
        Arc::new(NullSink),
    )
    .unwrap()
}

fn image_url(id: u64) -> String {
    format!("https://cdn.example/{}.jpg", id)
}

fn post(id: u64) -> serde_json::Value {
    json!({
        "id": id,
        "score": 10,
        "fav_count": 3,
        "rating": "g",
        "tag_string": "a b",
        "preview_file_url": image_url(id)
    })
}

#[tokio::test]
async fn subscribe_then_dispatch_delivers_only_new_posts() {
    let server = MockServer::start_async().await;
    let init = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/posts.json")
                .query_param("tags", "a order:id_desc")
                .query_param("limit", "1");
            then.status(200).json_body(json!([post(500)]));
        })
        .await;
    let fresh = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/posts.json")
                .query_param("tags", "a order:id_desc id:>500")
                .query_param("limit", "5");
            then.status(200).json_body(json!([post(501)]));
        })
        .await;

    let outbox = Arc::new(Outbox::default());
    let plugin = plugin_with(config(&server.base_url(), false), outbox.clone());
    let group = plugin
        .dispatcher()
        .subscribe_tag("g1", "a", Some("qq"), Some("s1"))
        .await
        .unwrap();
    assert_eq!(group.tags["a"].last_post_id, Some(500));
    assert!(outbox.taken().is_empty());
    init.assert_async().await;

    let report = plugin.dispatcher().run_cycle().await.unwrap();
    assert_eq!(report.tag_messages, 1);
    assert!(report.errors.is_empty());
    fresh.assert_async().await;

    let sent = outbox.taken();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "s1");
    let text = sent[0].1.text.as_deref().unwrap();
    assert!(text.contains("#501"));
    assert!(text.contains("/posts/501"));

    let stored = plugin.dispatcher().store().list_group("g1").await.unwrap().unwrap();
    assert_eq!(stored.tags["a"].last_post_id, Some(501));
}

#[tokio::test]
async fn every_group_gets_its_own_copy() {
    let server = MockServer::start_async().await;
    let feed = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/posts.json")
                .query_param("tags", "a order:id_desc")
                .query_param("limit", "5");
            then.status(200).json_body(json!([post(12), post(11)]));
        })
        .await;

    let outbox = Arc::new(Outbox::default());
    let plugin = plugin_with(config(&server.base_url(), false), outbox.clone());
    let store = plugin.dispatcher().store();
    store.subscribe_tag("g1", "a", None, Some("s1")).await.unwrap();
    store.subscribe_tag("g2", "a", None, Some("s2")).await.unwrap();

    let report = plugin.dispatcher().run_cycle().await.unwrap();
    assert_eq!(report.tag_messages, 4);
    assert_eq!(feed.hits_async().await, 2);

    let sent = outbox.taken();
    let to_s1: Vec<&str> = sent
        .iter()
        .filter(|(s, _)| s == "s1")
        .filter_map(|(_, m)| m.text.as_deref())
        .collect();
    assert_eq!(to_s1.len(), 2);
    // oldest first
    assert!(to_s1[0].contains("#11"));
    assert!(to_s1[1].contains("#12"));
    assert_eq!(sent.iter().filter(|(s, _)| s == "s2").count(), 2);
}

#[tokio::test]
async fn posts_already_sent_to_a_group_are_skipped() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/posts.json");
            then.status(200).json_body(json!([post(7)]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/explore/posts/popular.json")
                .query_param("scale", "day");
            then.status(200).json_body(json!([post(7), post(8)]));
        })
        .await;

    let outbox = Arc::new(Outbox::default());
    let plugin = plugin_with(config(&server.base_url(), false), outbox.clone());
    let store = plugin.dispatcher().store();
    store.subscribe_tag("g1", "a", None, Some("s1")).await.unwrap();
    store
        .set_popular("g1", true, None, None, Some(PopularScale::Day))
        .await
        .unwrap();

    let report = plugin.dispatcher().run_cycle_at(10_000).await.unwrap();
    assert_eq!(report.tag_messages, 1);
    assert_eq!(report.popular_messages, 1);

    let sent = outbox.taken();
    let summary = sent[1].1.text.as_deref().unwrap();
    assert!(summary.contains("#8"));
    assert!(!summary.contains("#7"));
}

#[tokio::test]
async fn popular_feed_respects_the_cooldown() {
    let server = MockServer::start_async().await;
    let feed = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/explore/posts/popular.json")
                .query_param("scale", "day");
            then.status(200).json_body(json!([post(1), post(2)]));
        })
        .await;

    let outbox = Arc::new(Outbox::default());
    let plugin = plugin_with(config(&server.base_url(), false), outbox.clone());
    let dispatcher = plugin.dispatcher();
    let start = 1_000_000;

    let outcome = dispatcher
        .subscribe_popular_at("g1", Some("qq"), Some("s1"), PopularScale::Day, start)
        .await
        .unwrap();
    assert_eq!(outcome.delivered.sent, 1);
    assert_eq!(outcome.group.popular.last_sent, start);
    assert_eq!(outbox.taken().len(), 1);
    assert_eq!(feed.hits_async().await, 1);

    let report = dispatcher.run_cycle_at(start + 60).await.unwrap();
    assert_eq!(report.popular_messages, 0);
    assert_eq!(feed.hits_async().await, 1);

    let later = start + 2 * 60 * 60;
    let report = dispatcher.run_cycle_at(later).await.unwrap();
    assert_eq!(feed.hits_async().await, 2);
    // same posts as the first batch
    assert_eq!(report.popular_messages, 0);
    assert!(outbox.taken().is_empty());
    let group = dispatcher.store().list_group("g1").await.unwrap().unwrap();
    assert_eq!(group.popular.last_sent, later);
}

#[tokio::test]
async fn popular_feed_is_fetched_once_per_scale() {
    let server = MockServer::start_async().await;
    let day = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/explore/posts/popular.json")
                .query_param("scale", "day");
            then.status(200).json_body(json!([post(1)]));
        })
        .await;
    let week = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/explore/posts/popular.json")
                .query_param("scale", "week");
            then.status(200).json_body(json!([post(2)]));
        })
        .await;

    let outbox = Arc::new(Outbox::default());
    let plugin = plugin_with(config(&server.base_url(), true), outbox.clone());
    let store = plugin.dispatcher().store();
    for (group, session, scale) in [
        ("g1", "s1", PopularScale::Day),
        ("g2", "s2", PopularScale::Day),
        ("g3", "s3", PopularScale::Week),
    ] {
        store
            .set_popular(group, true, None, Some(session), Some(scale))
            .await
            .unwrap();
    }
    store
        .set_popular("g4", true, None, None, Some(PopularScale::Day))
        .await
        .unwrap();

    let report = plugin.dispatcher().run_cycle_at(50_000).await.unwrap();
    assert_eq!(day.hits_async().await, 1);
    assert_eq!(week.hits_async().await, 1);
    assert_eq!(report.popular_messages, 3);

    let sent = outbox.taken();
    assert!(sent
        .iter()
        .all(|(_, m)| m.images == vec!["https://cdn.example/1.jpg".to_string()]
            || m.images == vec!["https://cdn.example/2.jpg".to_string()]));
    let mut sessions: Vec<&str> = sent.iter().map(|(s, _)| s.as_str()).collect();
    sessions.sort();
    assert_eq!(sessions, vec!["s1", "s2", "s3"]);
}

#[tokio::test]
async fn watermark_never_moves_backwards() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/posts.json");
            then.status(200).json_body(json!([post(10)]));
        })
        .await;

    let outbox = Arc::new(Outbox::default());
    let plugin = plugin_with(config(&server.base_url(), false), outbox.clone());
    let store = plugin.dispatcher().store();
    store.subscribe_tag("g1", "a", None, Some("s1")).await.unwrap();
    store.update_last_post("g1", "a", 900).await.unwrap();

    plugin.dispatcher().run_cycle().await.unwrap();
    let group = store.list_group("g1").await.unwrap().unwrap();
    assert_eq!(group.tags["a"].last_post_id, Some(900));
}

#[tokio::test]
async fn failed_sends_still_mark_posts_as_sent() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/posts.json");
            then.status(200).json_body(json!([post(42)]));
        })
        .await;

    let outbox = Arc::new(Outbox::failing());
    let plugin = plugin_with(config(&server.base_url(), false), outbox.clone());
    let store = plugin.dispatcher().store();
    store.subscribe_tag("g1", "a", None, Some("s1")).await.unwrap();

    let report = plugin.dispatcher().run_cycle().await.unwrap();
    assert_eq!(report.tag_messages, 0);
    assert_eq!(report.failed_sends, 1);

    let round = store.current_dedupe_round().await.unwrap();
    let pending = store.filter_new_post_ids("g1", &[42], round, 10).await.unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn upstream_errors_are_reported_per_tag() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/posts.json");
            then.status(403).json_body(json!({"message": "access denied"}));
        })
        .await;

    let outbox = Arc::new(Outbox::default());
    let plugin = plugin_with(config(&server.base_url(), false), outbox.clone());
    let store = plugin.dispatcher().store();
    store.subscribe_tag("g1", "a", None, Some("s1")).await.unwrap();
    store.update_last_post("g1", "a", 5).await.unwrap();

    let report = plugin.dispatcher().run_cycle().await.unwrap();
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("g1:a:"));
    let group = store.list_group("g1").await.unwrap().unwrap();
    assert_eq!(group.tags["a"].last_post_id, Some(5));
}

#[tokio::test]
async fn disabled_subscriptions_reject_commands() {
    let mut cfg = config("http://127.0.0.1:9", false);
    cfg.subscriptions.enabled = false;
    let mut plugin = plugin_with(cfg, Arc::new(Outbox::default()));
    let err = plugin
        .dispatcher()
        .subscribe_tag("g1", "a", None, Some("s1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Disabled));
    assert!(!plugin.start_subscriptions());
    plugin.terminate().await;
}

#[tokio::test]
async fn background_task_stops_on_terminate() {
    let server = MockServer::start_async().await;
    let mut plugin = plugin_with(config(&server.base_url(), false), Arc::new(Outbox::default()));
    assert!(plugin.start_subscriptions());
    assert!(plugin.is_running());
    assert!(!plugin.start_subscriptions());
    plugin.terminate().await;
    assert!(!plugin.is_running());
}

#[tokio::test]
async fn posts_with_unreachable_media_are_skipped() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/posts.json");
            then.status(200).json_body(json!([post(3), post(2), post(1)]));
        })
        .await;

    let outbox = Arc::new(Outbox::default());
    let media = Arc::new(Blocked(vec![image_url(2)]));
    let plugin = plugin_with_media(config(&server.base_url(), true), outbox.clone(), media);
    let store = plugin.dispatcher().store();
    store.subscribe_tag("g1", "a", None, Some("s1")).await.unwrap();

    let report = plugin.dispatcher().run_cycle().await.unwrap();
    assert_eq!(report.tag_messages, 2);

    let sent = outbox.taken();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1.images, vec![image_url(1)]);
    assert!(sent[0].1.text.as_deref().unwrap().contains("#1"));
    assert_eq!(sent[1].1.images, vec![image_url(3)]);
    assert!(sent.iter().all(|(_, m)| !m.images.contains(&image_url(2))));

    // skipped posts are not recorded as sent
    let round = store.current_dedupe_round().await.unwrap();
    let pending = store.filter_new_post_ids("g1", &[1, 2, 3], round, 10).await.unwrap();
    assert_eq!(pending, vec![2]);
    let group = store.list_group("g1").await.unwrap().unwrap();
    assert_eq!(group.tags["a"].last_post_id, Some(3));
}

#[tokio::test]
async fn watermark_advances_when_every_post_is_filtered() {
    let server = MockServer::start_async().await;
    let feed = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/posts.json")
                .query_param("tags", "a order:id_desc id:>10");
            then.status(200).json_body(json!([post(21), post(20)]));
        })
        .await;

    let outbox = Arc::new(Outbox::default());
    let media = Arc::new(Blocked(vec![image_url(20), image_url(21)]));
    let plugin = plugin_with_media(config(&server.base_url(), true), outbox.clone(), media);
    let store = plugin.dispatcher().store();
    store.subscribe_tag("g1", "a", None, Some("s1")).await.unwrap();
    store.update_last_post("g1", "a", 10).await.unwrap();

    let report = plugin.dispatcher().run_cycle().await.unwrap();
    feed.assert_async().await;
    assert_eq!(report.tag_messages, 0);
    assert_eq!(report.failed_sends, 0);
    assert!(outbox.taken().is_empty());

    let group = store.list_group("g1").await.unwrap().unwrap();
    assert_eq!(group.tags["a"].last_post_id, Some(21));
}

#[tokio::test]
async fn image_only_mode_sends_one_message_per_batch() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/posts.json");
            then.status(200).json_body(json!([post(33), post(32), post(31)]));
        })
        .await;

    let mut cfg = config(&server.base_url(), false);
    cfg.display.only_image = true;
    let outbox = Arc::new(Outbox::default());
    let plugin = plugin_with(cfg, outbox.clone());
    let store = plugin.dispatcher().store();
    store.subscribe_tag("g1", "a", None, Some("s1")).await.unwrap();

    let report = plugin.dispatcher().run_cycle().await.unwrap();
    assert_eq!(report.tag_messages, 1);

    let sent = outbox.taken();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "s1");
    assert_eq!(sent[0].1.text, None);
    assert_eq!(sent[0].1.images, vec![image_url(31), image_url(32), image_url(33)]);
}
