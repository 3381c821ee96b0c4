//! User submissions and comments.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::dedup::identity_of;
use crate::extract::MetadataExtractor;
use crate::rank;
use crate::store::Store;
use crate::types::{Comment, FeedrankError, NewPost, Post, Result, SyncConfig};
use crate::utils;

/// A link or text post composed by a user.
#[derive(Debug, Clone)]
pub struct Submission {
    pub user_id: i64,
    /// Used as the source key of the post's dedup identity, so the same link
    /// submitted by different users yields distinct posts.
    pub username: String,
    pub title: String,
    /// `None` for text-only posts; a permalink is generated instead.
    pub link: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

/// Accepts user posts and comments.
pub struct Submissions {
    store: Arc<dyn Store>,
    extractor: Arc<MetadataExtractor>,
    config: SyncConfig,
}

impl Submissions {
    pub fn new(store: Arc<dyn Store>, extractor: Arc<MetadataExtractor>, config: SyncConfig) -> Self {
        Self {
            store,
            extractor,
            config,
        }
    }

    /// Persists a user submission.
    ///
    /// Link posts get their media tags resolved from the target page; failures
    /// there degrade to a post without media. Text-only posts receive a
    /// generated permalink under the configured site URL. The post ranks
    /// immediately, unlike synced posts which wait for the rank batch.
    pub async fn submit(&self, submission: Submission) -> Result<Post> {
        let title = utils::unescape(submission.title.trim());
        if title.is_empty() {
            return Err(FeedrankError::InvalidSubmission("title is required".into()));
        }

        let (link, media) = match submission.link {
            Some(raw) => {
                let link = Url::parse(raw.trim())?.to_string();
                let mut media = match self.extractor.media_tags(&link).await {
                    Ok(tags) => tags,
                    Err(e) => {
                        debug!(link, error = %e, "media lookup failed for submission");
                        Default::default()
                    }
                };
                if media.image.is_some() {
                    media.image_alt = Some(title.clone());
                }
                (link, media)
            }
            None => {
                let link = format!("{}/p/{}", self.config.site_url, Uuid::new_v4());
                (link, Default::default())
            }
        };

        let now = Utc::now();
        let post = NewPost {
            channel_id: None,
            user_id: Some(submission.user_id),
            guid: identity_of(&submission.username, &link),
            slug: utils::slugify(&utils::truncate_words(&title, 10)),
            title,
            description: submission
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            link,
            img_url: media.image,
            // Clamped to their column widths.
            img_alt: media.image_alt.map(|alt| utils::truncate_chars(&alt, 256)),
            vid_url: media.video,
            vid_type: media.video_type.map(|t| utils::truncate_chars(&t, 50)),
            author: Some(utils::truncate_chars(&submission.username, 256)),
            published: now,
            rank: rank::post_rank(0, 0, now, self.config.rank_decay_seconds),
            tags: utils::clean_tags(submission.tags.iter().map(String::as_str)),
        };
        self.store.insert_post(post).await
    }

    /// Adds a comment to a post, optionally replying to another comment.
    pub async fn comment(
        &self,
        post_id: i64,
        user_id: i64,
        reply_to: Option<i64>,
        text: &str,
    ) -> Result<Comment> {
        let text = text.trim();
        if text.is_empty() {
            return Err(FeedrankError::InvalidSubmission("comment text is required".into()));
        }
        self.store.insert_comment(post_id, user_id, reply_to, text).await
    }

    /// Suggests a title for a URL a user is about to submit, from the page's
    /// own metadata.
    pub async fn suggest_title(&self, url: &str) -> Result<String> {
        self.extractor.page_title(url).await
    }
}
