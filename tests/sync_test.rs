use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use feedrank::fetcher::{FeedFetch, Page, PageFetch};
use feedrank::store::{MemoryStore, NewChannel, Store};
use feedrank::types::{Channel, FeedrankError, Result, SyncConfig, RANK_PENDING};
use feedrank::{ChannelRegistry, FeedSynchronizer, MetadataExtractor};

/// Serves a scripted feed document, counting fetches and optionally delaying
/// so concurrent syncs overlap.
struct ScriptedFeeds {
    xml: Mutex<String>,
    fetches: AtomicUsize,
    delay: Duration,
}

impl ScriptedFeeds {
    fn new(xml: &str) -> Self {
        Self {
            xml: Mutex::new(xml.to_string()),
            fetches: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(xml: &str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(xml)
        }
    }

    fn set_xml(&self, xml: &str) {
        *self.xml.lock().unwrap() = xml.to_string();
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedFetch for ScriptedFeeds {
    async fn fetch_feed(&self, url: &str) -> Result<feed_rs::model::Feed> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let xml = self.xml.lock().unwrap().clone();
        feed_rs::parser::parse(xml.as_bytes()).map_err(|e| FeedrankError::SourceUnavailable {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Serves scripted pages by exact URL; everything else is unreachable.
struct ScriptedPages {
    pages: HashMap<String, Page>,
}

impl ScriptedPages {
    fn empty() -> Self {
        Self {
            pages: HashMap::new(),
        }
    }

    fn with_page(mut self, url: &str, content_type: &str, body: &str) -> Self {
        self.pages.insert(
            url.to_string(),
            Page {
                content_type: content_type.to_string(),
                body: Some(body.to_string()),
            },
        );
        self
    }
}

#[async_trait]
impl PageFetch for ScriptedPages {
    async fn fetch_page(&self, url: &str) -> Result<Page> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| FeedrankError::FetchUnavailable {
                url: url.to_string(),
                reason: "unreachable".to_string(),
            })
    }
}

fn rss(items: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example News</title>
    <link>http://news.example</link>
    <description>All the example news</description>
    {items}
  </channel>
</rss>"#
    )
}

fn item(title: &str, link: &str) -> String {
    format!(
        r#"<item>
  <title>{title}</title>
  <link>{link}</link>
  <category>rust</category>
  <category>a</category>
</item>"#
    )
}

struct Fixture {
    store: Arc<MemoryStore>,
    feeds: Arc<ScriptedFeeds>,
    sync: Arc<FeedSynchronizer>,
}

fn fixture(feeds: ScriptedFeeds, pages: ScriptedPages) -> Fixture {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let feeds = Arc::new(feeds);
    let extractor = Arc::new(MetadataExtractor::new(Arc::new(pages)));
    let sync = Arc::new(FeedSynchronizer::new(
        store.clone() as Arc<dyn Store>,
        feeds.clone() as Arc<dyn FeedFetch>,
        extractor,
        SyncConfig::default(),
    ));
    Fixture { store, feeds, sync }
}

/// Registers a channel with subscribers whose last sync is two hours old.
async fn stale_channel(store: &Arc<MemoryStore>, subscribers: i64) -> Channel {
    let channel = store
        .insert_channel(NewChannel {
            url: "http://news.example/rss".to_string(),
            link: "http://news.example".to_string(),
            title: "Example News".to_string(),
            description: Some("All the example news".to_string()),
            icon_url: Some("http://news.example/favicon.ico".to_string()),
            is_default: false,
            published: Utc::now(),
            sync_on: Utc::now() - ChronoDuration::hours(2),
        })
        .await
        .unwrap();
    for user_id in 1..=subscribers {
        store.subscribe(channel.channel_id, user_id).await.unwrap();
    }
    store.channel(channel.channel_id).await.unwrap()
}

#[tokio::test]
async fn sync_ingests_new_entries() {
    let _ = tracing_subscriber::fmt().try_init();
    let xml = rss(&format!(
        "{}{}",
        item("First Story", "http://news.example/one"),
        item("Second &amp; Story", "http://news.example/two"),
    ));
    let f = fixture(ScriptedFeeds::new(&xml), ScriptedPages::empty());
    let channel = stale_channel(&f.store, 1).await;

    let report = f.sync.sync_channel(channel.channel_id).await.unwrap().unwrap();
    assert_eq!(report.new_posts, 2);
    assert_eq!(report.failures, 0);

    let posts = f.store.posts_for_channel(channel.channel_id).await.unwrap();
    assert_eq!(posts.len(), 2);
    let second = posts.iter().find(|p| p.link.ends_with("/two")).unwrap();
    // Entity-decoded before storage and dedup.
    assert_eq!(second.title, "Second & Story");
    assert_eq!(second.rank, RANK_PENDING);
    assert_eq!(second.slug, "second-story");
    // Single-letter categories are dropped.
    assert_eq!(second.tags, "rust");
    assert!(second.guid != 0);
}

#[tokio::test]
async fn resync_skips_known_entries() {
    let xml = rss(&item("First Story", "http://news.example/one"));
    let f = fixture(ScriptedFeeds::new(&xml), ScriptedPages::empty());
    let channel = stale_channel(&f.store, 1).await;

    let first = f.sync.sync_channel(channel.channel_id).await.unwrap().unwrap();
    assert_eq!(first.new_posts, 1);

    let second = f.sync.sync_channel(channel.channel_id).await.unwrap().unwrap();
    assert_eq!(second.new_posts, 0);
    assert_eq!(second.duplicates, 1);
    assert_eq!(f.store.posts_for_channel(channel.channel_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rotated_tracking_params_hit_the_title_guard() {
    let xml = rss(&item("Same Headline", "http://news.example/story?utm=aaa"));
    let f = fixture(ScriptedFeeds::new(&xml), ScriptedPages::empty());
    let channel = stale_channel(&f.store, 1).await;
    f.sync.sync_channel(channel.channel_id).await.unwrap().unwrap();

    // Same entry, rotated query string: different guid, identical title.
    f.feeds
        .set_xml(&rss(&item("Same Headline", "http://news.example/story?utm=bbb")));
    let report = f.sync.sync_channel(channel.channel_id).await.unwrap().unwrap();
    assert_eq!(report.new_posts, 0);
    assert_eq!(report.duplicates, 1);
}

#[tokio::test]
async fn concurrent_syncs_collapse_to_one_fetch() {
    let xml = rss(&item("First Story", "http://news.example/one"));
    let f = fixture(
        ScriptedFeeds::with_delay(&xml, Duration::from_millis(100)),
        ScriptedPages::empty(),
    );
    let channel = stale_channel(&f.store, 5).await;

    let (a, b, c) = tokio::join!(
        f.sync.sync_channel(channel.channel_id),
        f.sync.sync_channel(channel.channel_id),
        f.sync.sync_channel(channel.channel_id),
    );
    let completed = [a.unwrap(), b.unwrap(), c.unwrap()]
        .into_iter()
        .flatten()
        .count();
    assert_eq!(completed, 1);
    assert_eq!(f.feeds.fetch_count(), 1);

    // The slot frees once the sync completes.
    assert!(f.sync.sync_channel(channel.channel_id).await.unwrap().is_some());
    assert_eq!(f.feeds.fetch_count(), 2);
}

#[tokio::test]
async fn trigger_respects_the_staleness_policy() {
    let xml = rss(&item("First Story", "http://news.example/one"));
    let f = fixture(ScriptedFeeds::new(&xml), ScriptedPages::empty());

    // Two hours since the last sync, five subscribers: eligible.
    let stale = stale_channel(&f.store, 5).await;
    assert!(f.sync.should_sync(&stale, false));

    // Freshly synced: only a forced refresh goes through.
    let mut fresh = stale.clone();
    fresh.sync_on = Utc::now();
    assert!(!f.sync.should_sync(&fresh, false));
    assert!(f.sync.should_sync(&fresh, true));

    // No subscribers or muted: never eligible, forced or not.
    let mut unsubscribed = stale.clone();
    unsubscribed.subscription_count = 0;
    assert!(!f.sync.should_sync(&unsubscribed, true));
    let mut muted = stale.clone();
    muted.is_muted = true;
    assert!(!f.sync.should_sync(&muted, true));
}

#[tokio::test]
async fn trigger_spawns_once_and_drops_the_second() {
    let xml = rss(&item("First Story", "http://news.example/one"));
    let f = fixture(
        ScriptedFeeds::with_delay(&xml, Duration::from_millis(100)),
        ScriptedPages::empty(),
    );
    let channel = stale_channel(&f.store, 5).await;

    assert!(f.sync.trigger(&channel, false));
    assert!(!f.sync.trigger(&channel, false));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(f.feeds.fetch_count(), 1);
    assert_eq!(f.store.posts_for_channel(channel.channel_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unreachable_feed_aborts_without_touching_posts() {
    let f = fixture(ScriptedFeeds::new("this is not xml"), ScriptedPages::empty());
    let channel = stale_channel(&f.store, 1).await;

    let err = f.sync.sync_channel(channel.channel_id).await.unwrap_err();
    assert!(matches!(err, FeedrankError::SourceUnavailable { .. }));
    assert!(f.store.posts_for_channel(channel.channel_id).await.unwrap().is_empty());

    // The flight slot was released on the error path.
    f.feeds.set_xml(&rss(&item("Recovered", "http://news.example/one")));
    assert!(f.sync.sync_channel(channel.channel_id).await.unwrap().is_some());
}

#[tokio::test]
async fn bad_entries_do_not_poison_the_batch() {
    // Middle item has no title; the other two are fine.
    let xml = rss(&format!(
        "{}<item><link>http://news.example/untitled</link></item>{}",
        item("First Story", "http://news.example/one"),
        item("Second Story", "http://news.example/two"),
    ));
    let f = fixture(ScriptedFeeds::new(&xml), ScriptedPages::empty());
    let channel = stale_channel(&f.store, 1).await;

    let report = f.sync.sync_channel(channel.channel_id).await.unwrap().unwrap();
    assert_eq!(report.new_posts, 2);
    assert_eq!(report.failures, 1);
}

#[tokio::test]
async fn sync_backfills_missing_channel_details() {
    let xml = rss(&item("First Story", "http://news.example/one"));
    let pages = ScriptedPages::empty().with_page(
        "http://news.example",
        "text/html",
        r#"<head>
            <link rel="shortcut icon" href="http://news.example/icon.png">
            <meta name="description" content="From the site page">
        </head>"#,
    );
    let f = fixture(ScriptedFeeds::new(&xml), pages);

    let channel = f
        .store
        .insert_channel(NewChannel {
            url: "http://news.example/rss".to_string(),
            link: "http://news.example".to_string(),
            title: "Example News".to_string(),
            description: None,
            icon_url: None,
            is_default: false,
            published: Utc::now(),
            sync_on: Utc::now() - ChronoDuration::hours(2),
        })
        .await
        .unwrap();
    f.store.subscribe(channel.channel_id, 1).await.unwrap();

    f.sync.sync_channel(channel.channel_id).await.unwrap().unwrap();
    let channel = f.store.channel(channel.channel_id).await.unwrap();
    assert_eq!(channel.icon_url.as_deref(), Some("http://news.example/icon.png"));
    assert_eq!(channel.description.as_deref(), Some("From the site page"));
}

#[tokio::test]
async fn sync_prefers_page_media_for_entries() {
    let xml = rss(&item("Illustrated Story", "http://news.example/pic"));
    let pages = ScriptedPages::empty().with_page(
        "http://news.example/pic",
        "text/html",
        r#"<meta property="og:image" content="http://img.example/lead.png?w=300">"#,
    );
    let f = fixture(ScriptedFeeds::new(&xml), pages);
    let channel = stale_channel(&f.store, 1).await;

    f.sync.sync_channel(channel.channel_id).await.unwrap().unwrap();
    let posts = f.store.posts_for_channel(channel.channel_id).await.unwrap();
    // Size params stripped, alt text from the entry title.
    assert_eq!(posts[0].img_url.as_deref(), Some("http://img.example/lead.png"));
    assert_eq!(posts[0].img_alt.as_deref(), Some("Illustrated Story"));
}

#[tokio::test]
async fn oversized_entry_fields_are_clamped_to_their_columns() {
    // 60 five-character words: 299 characters, past the 256-char alt column.
    let title = "word ".repeat(60).trim().to_string();
    let xml = rss(&item(&title, "http://news.example/long"));
    let pages = ScriptedPages::empty().with_page(
        "http://news.example/long",
        "text/html",
        r#"<meta property="og:image" content="http://img.example/lead.png">"#,
    );
    let f = fixture(ScriptedFeeds::new(&xml), pages);
    let channel = stale_channel(&f.store, 1).await;

    let report = f.sync.sync_channel(channel.channel_id).await.unwrap().unwrap();
    assert_eq!(report.new_posts, 1);

    let posts = f.store.posts_for_channel(channel.channel_id).await.unwrap();
    // Title and link columns are unbounded; alt text is not.
    assert_eq!(posts[0].title, title);
    assert_eq!(posts[0].img_alt.as_ref().unwrap().chars().count(), 256);
}

#[tokio::test]
async fn channel_registration_is_idempotent_by_url() {
    let xml = rss("");
    let store = Arc::new(MemoryStore::new());
    let feeds = Arc::new(ScriptedFeeds::new(&xml));
    let extractor = Arc::new(MetadataExtractor::new(Arc::new(ScriptedPages::empty())));
    let registry = ChannelRegistry::new(
        store.clone() as Arc<dyn Store>,
        feeds.clone() as Arc<dyn FeedFetch>,
        extractor,
    );

    let first = registry.add_channel("http://news.example/rss", false).await.unwrap();
    assert_eq!(first.title, "Example News");
    // Feed metadata backs the description when the site page is unreachable.
    assert_eq!(first.description.as_deref(), Some("All the example news"));

    let again = registry.add_channel("http://news.example/rss", false).await.unwrap();
    assert_eq!(again.channel_id, first.channel_id);
    // Known URLs never refetch the feed.
    assert_eq!(feeds.fetch_count(), 1);

    // Subscriptions are created once per user and counted on the channel.
    let (channel, created) = registry.subscribe("http://news.example/rss", 7).await.unwrap();
    assert!(created);
    let (_, created_again) = registry.subscribe("http://news.example/rss", 7).await.unwrap();
    assert!(!created_again);
    assert_eq!(store.channel(channel.channel_id).await.unwrap().subscription_count, 1);

    assert!(registry.unsubscribe(channel.channel_id, 7).await.unwrap());
    assert_eq!(store.channel(channel.channel_id).await.unwrap().subscription_count, 0);

    let err = registry.add_channel("not a url", false).await.unwrap_err();
    assert!(matches!(err, FeedrankError::InvalidUrl(_)));
}

#[tokio::test]
async fn sync_falls_back_to_body_image() {
    let body = r#"<p>Intro <img src="http://img.example/inline.jpg" alt="Inline shot"></p>"#;
    let xml = rss(&format!(
        r#"<item>
  <title>Body Image Story</title>
  <link>http://news.example/body</link>
  <description>{}</description>
</item>"#,
        html_escape::encode_text(body),
    ));
    // The entry page is unreachable, so the body scan is the only source.
    let f = fixture(ScriptedFeeds::new(&xml), ScriptedPages::empty());
    let channel = stale_channel(&f.store, 1).await;

    f.sync.sync_channel(channel.channel_id).await.unwrap().unwrap();
    let posts = f.store.posts_for_channel(channel.channel_id).await.unwrap();
    assert_eq!(posts[0].img_url.as_deref(), Some("http://img.example/inline.jpg"));
    assert_eq!(posts[0].img_alt.as_deref(), Some("Inline shot"));
}
