//! Channel registration and subscription management.

use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::extract::MetadataExtractor;
use crate::fetcher::FeedFetch;
use crate::store::{NewChannel, Store};
use crate::types::{Channel, Result};

/// Registers channels and manages user subscriptions.
pub struct ChannelRegistry {
    store: Arc<dyn Store>,
    feeds: Arc<dyn FeedFetch>,
    extractor: Arc<MetadataExtractor>,
}

impl ChannelRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        feeds: Arc<dyn FeedFetch>,
        extractor: Arc<MetadataExtractor>,
    ) -> Self {
        Self {
            store,
            feeds,
            extractor,
        }
    }

    /// Registers the feed at `feed_url`, or returns the existing channel when
    /// the URL is already known. The feed is fetched once up front, so a dead
    /// or unparsable URL never becomes a channel.
    pub async fn add_channel(&self, feed_url: &str, is_default: bool) -> Result<Channel> {
        let parsed = Url::parse(feed_url)?;
        if let Some(existing) = self.store.channel_by_url(feed_url).await? {
            return Ok(existing);
        }

        let feed = self.feeds.fetch_feed(feed_url).await?;
        let link = feed
            .links
            .first()
            .map(|l| l.href.clone())
            .unwrap_or_else(|| feed_url.to_string());
        let title = feed
            .title
            .as_ref()
            .map(|t| crate::utils::unescape(&t.content))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| parsed.host_str().unwrap_or(feed_url).to_string());
        let feed_icon = feed
            .logo
            .as_ref()
            .or(feed.icon.as_ref())
            .map(|image| image.uri.clone());
        let feed_description = feed.description.as_ref().map(|t| t.content.clone());
        let (icon_url, description) = self
            .extractor
            .icon_and_description(&link, feed_icon.as_deref(), feed_description.as_deref())
            .await
            .unwrap_or((feed_icon, feed_description));

        let channel = self
            .store
            .insert_channel(NewChannel {
                url: feed_url.to_string(),
                link,
                title,
                description,
                icon_url,
                is_default,
                published: feed.published.unwrap_or_else(Utc::now),
                // Epoch sentinel: the channel is immediately stale, so the
                // first trigger after a subscription syncs it.
                sync_on: chrono::DateTime::UNIX_EPOCH,
            })
            .await?;
        info!(channel_id = channel.channel_id, url = feed_url, "channel registered");
        Ok(channel)
    }

    /// Subscribes a user, registering the channel first when needed. Returns
    /// the channel and whether a new subscription was created.
    pub async fn subscribe(&self, feed_url: &str, user_id: i64) -> Result<(Channel, bool)> {
        let channel = self.add_channel(feed_url, false).await?;
        let created = self.store.subscribe(channel.channel_id, user_id).await?;
        Ok((channel, created))
    }

    pub async fn unsubscribe(&self, channel_id: i64, user_id: i64) -> Result<bool> {
        self.store.unsubscribe(channel_id, user_id).await
    }
}
