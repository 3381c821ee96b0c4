use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rank assigned to freshly synced posts; a scheduled batch replaces it with a
/// real rank later. Below any value the rank engine can produce.
pub const RANK_PENDING: f64 = -999.0;

/// An external feed origin polled for new posts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: i64,
    /// Fetch URL of the feed document. Globally unique.
    pub url: String,
    /// Canonical link of the site the feed belongs to.
    pub link: String,
    pub title: String,
    pub description: Option<String>,
    pub icon_url: Option<String>,
    pub is_default: bool,
    pub is_muted: bool,
    /// Timestamp of the last completed sync.
    pub sync_on: DateTime<Utc>,
    /// Publish date reported by the feed itself.
    pub published: DateTime<Utc>,
    pub subscription_count: i64,
    pub created_on: DateTime<Utc>,
}

/// A unit of content, either channel-derived or user-submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub post_id: i64,
    pub channel_id: Option<i64>,
    pub user_id: Option<i64>,
    /// Deduplication identity, stable across re-syncs.
    pub guid: i64,
    pub title: String,
    pub description: Option<String>,
    pub slug: String,
    pub link: String,
    pub img_url: Option<String>,
    pub img_alt: Option<String>,
    pub vid_url: Option<String>,
    pub vid_type: Option<String>,
    pub author: Option<String>,
    pub published: DateTime<Utc>,
    pub up_votes: i64,
    pub down_votes: i64,
    /// Net score, kept equal to `up_votes - down_votes`.
    pub votes: i64,
    pub rank: f64,
    /// Comma-joined cleaned tag list. Empty string means no tags.
    pub tags: String,
    pub comment_count: i64,
    pub is_muted: bool,
    pub created_on: DateTime<Utc>,
}

/// Fields of a post not owned by the datastore; everything the synchronizer or
/// a submission produces before the row exists.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub channel_id: Option<i64>,
    pub user_id: Option<i64>,
    pub guid: i64,
    pub title: String,
    pub description: Option<String>,
    pub slug: String,
    pub link: String,
    pub img_url: Option<String>,
    pub img_alt: Option<String>,
    pub vid_url: Option<String>,
    pub vid_type: Option<String>,
    pub author: Option<String>,
    pub published: DateTime<Utc>,
    pub rank: f64,
    pub tags: String,
}

/// A user comment on a post, optionally a reply to another comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: i64,
    pub post_id: i64,
    pub reply_to: Option<i64>,
    pub user_id: i64,
    pub comment_text: String,
    pub up_votes: i64,
    pub down_votes: i64,
    pub votes: i64,
    pub rank: f64,
    pub reply_count: i64,
    pub is_muted: bool,
    pub created_on: DateTime<Utc>,
}

/// Stored vote value for a (voter, target) pair.
///
/// A missing vote row means the user never voted; `Neutral` means they voted
/// and later retracted it. The two are deliberately distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteState {
    Up,
    Neutral,
    Down,
}

impl VoteState {
    pub fn value(self) -> i32 {
        match self {
            VoteState::Up => 1,
            VoteState::Neutral => 0,
            VoteState::Down => -1,
        }
    }

    pub fn from_value(value: i32) -> Self {
        match value {
            v if v > 0 => VoteState::Up,
            v if v < 0 => VoteState::Down,
            _ => VoteState::Neutral,
        }
    }
}

/// Direction a voter requests; the ledger maps it onto a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDirection {
    Up,
    Down,
}

/// HTTP client configuration for feed and page fetches.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Descriptive User-Agent identifying the aggregator, required by policy.
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "feedrank/0.1 (+mailto:ops@feedrank.example)".to_string(),
            timeout_seconds: 30,
            max_redirects: 5,
        }
    }
}

/// Synchronizer and ranking knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// A channel is stale once its last sync is older than this.
    pub stale_after_minutes: i64,
    /// Divisor applied to the creation timestamp in the hot rank. Tunable.
    pub rank_decay_seconds: f64,
    /// Base URL used when generating permalinks for text-only submissions.
    pub site_url: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_after_minutes: 60,
            rank_decay_seconds: 45_000.0,
            site_url: "https://feedrank.example".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedrankError {
    /// Network or transport failure fetching a page.
    #[error("could not reach {url}: {reason}")]
    FetchUnavailable { url: String, reason: String },

    /// Content was fetched but carried no usable title or tags.
    #[error("no usable metadata found at {url}")]
    MetadataUnavailable { url: String },

    /// Feed document fetch or parse failed; the source is left untouched.
    #[error("feed unavailable at {url}: {reason}")]
    SourceUnavailable { url: String, reason: String },

    /// The item already exists; suppressed silently during sync.
    #[error("duplicate entry")]
    DuplicateEntry,

    /// Voting requires a resolved user identity.
    #[error("vote rejected: not authenticated")]
    VoteRejected,

    /// User-provided content failed validation before persistence.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// A concurrent counter update won the race; the caller may retry.
    #[error("transaction conflict, retry")]
    TransactionConflict,

    #[error("channel not found: {0}")]
    ChannelNotFound(i64),

    #[error("post not found: {0}")]
    PostNotFound(i64),

    #[error("comment not found: {0}")]
    CommentNotFound(i64),

    #[error("user not found: {0}")]
    UserNotFound(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, FeedrankError>;
