//! Per-channel feed synchronization.
//!
//! Concurrent refresh triggers for one channel collapse into a single
//! in-flight sync: a mutex-guarded registry records which channels are
//! syncing, and later triggers are dropped silently. The lock only covers
//! set membership; a slow fetch for one channel never blocks trigger
//! evaluation for another.

use chrono::{Duration, Utc};
use feed_rs::model::{Entry, Feed};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::dedup::{identity_of, Deduplicator};
use crate::extract::{self, ContentVariant, MediaTags, MetadataExtractor};
use crate::fetcher::FeedFetch;
use crate::store::Store;
use crate::types::{Channel, FeedrankError, NewPost, Result, SyncConfig, RANK_PENDING};
use crate::utils;

/// Counts out of one completed sync pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub entries: usize,
    pub new_posts: usize,
    pub duplicates: usize,
    pub failures: usize,
}

/// Membership in the "currently syncing" set, released on drop so the slot
/// frees on every exit path, including panics and early returns.
struct FlightGuard {
    registry: Arc<Mutex<HashSet<i64>>>,
    channel_id: i64,
}

impl FlightGuard {
    fn acquire(registry: &Arc<Mutex<HashSet<i64>>>, channel_id: i64) -> Option<Self> {
        let mut in_flight = registry.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(channel_id) {
            return None;
        }
        Some(Self {
            registry: Arc::clone(registry),
            channel_id,
        })
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.channel_id);
    }
}

/// Orchestrates fetch, extraction, dedup, and persistence for channels.
pub struct FeedSynchronizer {
    store: Arc<dyn Store>,
    feeds: Arc<dyn FeedFetch>,
    extractor: Arc<MetadataExtractor>,
    dedup: Deduplicator,
    config: SyncConfig,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl FeedSynchronizer {
    pub fn new(
        store: Arc<dyn Store>,
        feeds: Arc<dyn FeedFetch>,
        extractor: Arc<MetadataExtractor>,
        config: SyncConfig,
    ) -> Self {
        let dedup = Deduplicator::new(Arc::clone(&store));
        Self {
            store,
            feeds,
            extractor,
            dedup,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Refresh eligibility: not muted, has subscribers, and either forced or
    /// stale (last sync older than the configured threshold).
    pub fn should_sync(&self, channel: &Channel, forced: bool) -> bool {
        if channel.is_muted || channel.subscription_count == 0 {
            return false;
        }
        forced || channel.sync_on < Utc::now() - Duration::minutes(self.config.stale_after_minutes)
    }

    /// Fires an asynchronous sync for an eligible channel.
    ///
    /// Returns true when a sync was started. Ineligible channels and
    /// channels that already have a sync in flight are dropped silently; the
    /// caller never blocks on completion.
    pub fn trigger(self: &Arc<Self>, channel: &Channel, forced: bool) -> bool {
        if !self.should_sync(channel, forced) {
            return false;
        }
        let Some(guard) = FlightGuard::acquire(&self.in_flight, channel.channel_id) else {
            debug!(channel_id = channel.channel_id, "sync already in flight, dropping trigger");
            return false;
        };

        let sync = Arc::clone(self);
        let channel_id = channel.channel_id;
        tokio::spawn(async move {
            let _slot = guard;
            match sync.run_sync(channel_id).await {
                Ok(report) => {
                    info!(channel_id, ?report, "sync finished");
                }
                Err(e) => {
                    error!(channel_id, error = %e, "sync aborted");
                }
            }
        });
        true
    }

    /// Runs one sync to completion, awaitable. Returns `None` when another
    /// sync for the channel is already in flight.
    pub async fn sync_channel(&self, channel_id: i64) -> Result<Option<SyncReport>> {
        let Some(_slot) = FlightGuard::acquire(&self.in_flight, channel_id) else {
            debug!(channel_id, "sync already in flight, dropping request");
            return Ok(None);
        };
        self.run_sync(channel_id).await.map(Some)
    }

    /// The sync procedure proper. The caller holds the flight slot.
    async fn run_sync(&self, channel_id: i64) -> Result<SyncReport> {
        let channel = self.store.channel(channel_id).await?;
        // A failed fetch or parse aborts this sync only; prior channel state
        // stays untouched.
        let feed = self.feeds.fetch_feed(&channel.url).await?;

        let now = Utc::now();
        let published = feed.published.unwrap_or(now);

        let details = if channel.description.is_none() || channel.icon_url.is_none() {
            Some(self.backfill_details(&channel, &feed).await)
        } else {
            None
        };
        self.store
            .update_channel_sync(channel_id, published, now, details)
            .await?;

        let mut report = SyncReport {
            entries: feed.entries.len(),
            ..SyncReport::default()
        };
        for entry in &feed.entries {
            match self.ingest_entry(&channel, entry, now).await {
                Ok(true) => report.new_posts += 1,
                Ok(false) => report.duplicates += 1,
                Err(e) => {
                    // Per-entry failures never abort the rest of the batch.
                    warn!(channel_id, error = %e, "skipping entry");
                    report.failures += 1;
                }
            }
        }
        Ok(report)
    }

    /// Resolves (description, icon_url) for a channel that lacks one of
    /// them: the channel's site page first, the feed's own metadata second.
    async fn backfill_details(
        &self,
        channel: &Channel,
        feed: &Feed,
    ) -> (Option<String>, Option<String>) {
        let site_link = feed
            .links
            .first()
            .map(|l| l.href.clone())
            .unwrap_or_else(|| channel.link.clone());
        let feed_icon = feed
            .logo
            .as_ref()
            .or(feed.icon.as_ref())
            .map(|image| image.uri.clone());
        let feed_description = feed.description.as_ref().map(|t| t.content.clone());

        match self
            .extractor
            .icon_and_description(&site_link, feed_icon.as_deref(), feed_description.as_deref())
            .await
        {
            Ok((icon, description)) => (description, icon),
            Err(e) => {
                warn!(channel_id = channel.channel_id, error = %e, "detail backfill failed, using feed metadata");
                (feed_description, feed_icon)
            }
        }
    }

    /// Ingests one feed entry. Returns true when a new post was persisted,
    /// false when the entry was a duplicate.
    async fn ingest_entry(
        &self,
        channel: &Channel,
        entry: &Entry,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool> {
        let link = entry
            .links
            .first()
            .map(|l| l.href.clone())
            .ok_or_else(|| FeedrankError::MetadataUnavailable {
                url: channel.url.clone(),
            })?;
        let title = entry
            .title
            .as_ref()
            .map(|t| utils::unescape(&t.content))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FeedrankError::MetadataUnavailable { url: link.clone() })?;

        let guid = identity_of(&channel.url, &link);
        if self
            .dedup
            .is_duplicate(channel.channel_id, guid, &title)
            .await?
        {
            debug!(channel_id = channel.channel_id, guid, "duplicate entry");
            return Ok(false);
        }

        let media = self.entry_media(entry, &link, &title).await;
        let tags = utils::clean_tags(entry.categories.iter().map(|c| c.term.as_str()));
        let author = entry
            .authors
            .first()
            .map(|a| utils::truncate_chars(&a.name, 256))
            .filter(|name| !name.is_empty());

        let post = NewPost {
            channel_id: Some(channel.channel_id),
            user_id: None,
            guid,
            slug: utils::slugify(&utils::truncate_words(&title, 10)),
            title,
            description: None,
            link,
            img_url: media.image,
            // Clamped to their column widths; feeds put anything in these.
            img_alt: media.image_alt.map(|alt| utils::truncate_chars(&alt, 256)),
            vid_url: media.video,
            vid_type: media.video_type.map(|t| utils::truncate_chars(&t, 50)),
            author,
            published: entry.published.map(|dt| dt.with_timezone(&Utc)).unwrap_or(now),
            rank: RANK_PENDING,
            tags,
        };

        match self.store.insert_post(post).await {
            Ok(_) => Ok(true),
            // Raced against another sync or an identical link; suppressed.
            Err(FeedrankError::DuplicateEntry) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Media resolution order: feed enclosure, then the entry's own page,
    /// then the first raster image in the entry body.
    async fn entry_media(&self, entry: &Entry, link: &str, title: &str) -> MediaTags {
        let mut media = enclosure_media(entry);
        if media.image.is_some() {
            media.image_alt = Some(title.to_string());
        }
        if !media.is_empty() {
            return media;
        }

        match self.extractor.media_tags(link).await {
            Ok(tags) if !tags.is_empty() => {
                let mut tags = tags;
                if tags.image.is_some() {
                    tags.image_alt = Some(title.to_string());
                }
                return tags;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(link, error = %e, "page media fetch failed, scanning entry body");
            }
        }

        let mut variants = Vec::new();
        if let Some(content) = &entry.content {
            if let Some(body) = &content.body {
                variants.push(ContentVariant {
                    media_type: content.content_type.essence_str().to_string(),
                    body: body.clone(),
                });
            }
        }
        let summary = entry.summary.as_ref().map(|t| t.content.as_str());
        if let Some(body) = extract::best_content(&variants, summary) {
            if let Some((src, alt)) = extract::first_inline_image(&body) {
                return MediaTags {
                    image: Some(src),
                    image_alt: alt,
                    video: None,
                    video_type: None,
                };
            }
        }
        MediaTags::default()
    }
}

/// First usable enclosure of a feed entry, if any.
fn enclosure_media(entry: &Entry) -> MediaTags {
    for media_obj in &entry.media {
        for content in &media_obj.content {
            let (Some(url), Some(mime)) = (&content.url, &content.content_type) else {
                continue;
            };
            let essence = mime.essence_str();
            if essence.starts_with("image/") {
                return MediaTags {
                    image: Some(extract::normalize_image_url(url.as_str())),
                    ..MediaTags::default()
                };
            }
            if essence.starts_with("video/") || essence == extract::FLASH_MIME {
                return MediaTags {
                    video: Some(url.to_string()),
                    video_type: Some(essence.to_string()),
                    ..MediaTags::default()
                };
            }
        }
    }
    MediaTags::default()
}
