//! Datastore contract the core depends on.
//!
//! The core needs three guarantees from a backend: unique-constraint inserts,
//! conditional updates, and row-transactional vote application. Everything
//! else (listing, pagination, decoration) lives outside this crate.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{Channel, Comment, NewPost, Post, Result, VoteDirection, VoteState};

/// What a vote applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoteTarget {
    Post(i64),
    Comment(i64),
}

/// Result of one committed vote transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoteOutcome {
    /// Post-transition stored vote value.
    pub new_state: VoteState,
    /// Signed change in (up - down) applied to the target.
    pub net_delta: i64,
}

/// A channel as it exists before the datastore assigns identity.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub url: String,
    pub link: String,
    pub title: String,
    pub description: Option<String>,
    pub icon_url: Option<String>,
    pub is_default: bool,
    pub published: DateTime<Utc>,
    pub sync_on: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ===== Channels =====

    /// Inserts a channel. The fetch URL is globally unique; a second insert
    /// with the same URL fails with `DuplicateEntry`.
    async fn insert_channel(&self, channel: NewChannel) -> Result<Channel>;

    async fn channel(&self, channel_id: i64) -> Result<Channel>;

    async fn channel_by_url(&self, url: &str) -> Result<Option<Channel>>;

    async fn list_channels(&self) -> Result<Vec<Channel>>;

    /// Updates sync metadata after a successful refresh. `details` carries
    /// the backfilled (description, icon_url) when the channel lacked them.
    async fn update_channel_sync(
        &self,
        channel_id: i64,
        published: DateTime<Utc>,
        sync_on: DateTime<Utc>,
        details: Option<(Option<String>, Option<String>)>,
    ) -> Result<()>;

    /// Subscribes a user; returns false when already subscribed. Adjusts the
    /// channel's subscriber count in the same unit of work.
    async fn subscribe(&self, channel_id: i64, user_id: i64) -> Result<bool>;

    async fn unsubscribe(&self, channel_id: i64, user_id: i64) -> Result<bool>;

    // ===== Posts =====

    /// True when a post with this guid *or* this exact title already exists
    /// for the channel.
    async fn post_exists(&self, channel_id: i64, guid: i64, title: &str) -> Result<bool>;

    /// Inserts a post. A unique-constraint collision on
    /// (channel, user, link) fails with `DuplicateEntry`. User-authored posts
    /// bump the author's lifetime post count in the same unit of work.
    async fn insert_post(&self, post: NewPost) -> Result<Post>;

    async fn post(&self, post_id: i64) -> Result<Post>;

    async fn posts_for_channel(&self, channel_id: i64) -> Result<Vec<Post>>;

    // ===== Comments =====

    /// Inserts a comment, bumping the post's comment count and, for replies,
    /// the parent's reply count.
    async fn insert_comment(
        &self,
        post_id: i64,
        user_id: i64,
        reply_to: Option<i64>,
        text: &str,
    ) -> Result<Comment>;

    async fn comment(&self, comment_id: i64) -> Result<Comment>;

    // ===== Votes =====

    /// Stored vote value for a (voter, target) pair. `None` means the user
    /// never voted; `Some(Neutral)` means voted then retracted.
    async fn vote_state(&self, user_id: i64, target: VoteTarget) -> Result<Option<VoteState>>;

    /// Applies one vote transition as a single atomic unit: vote-row upsert,
    /// voter lifetime counters, target aggregates, and target rank commit
    /// together or not at all. Two concurrent votes on one target serialize
    /// here; a lost race surfaces as `TransactionConflict`.
    async fn apply_vote(
        &self,
        user_id: i64,
        target: VoteTarget,
        direction: VoteDirection,
    ) -> Result<VoteOutcome>;

    /// Voter's lifetime (up, down) counters, maintained by `apply_vote`.
    async fn user_vote_counters(&self, user_id: i64) -> Result<(i64, i64)>;

    /// Lifetime count of user-authored posts, maintained by `insert_post`.
    async fn user_post_count(&self, user_id: i64) -> Result<i64>;
}
