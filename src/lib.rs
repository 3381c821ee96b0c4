pub mod channels;
pub mod dedup;
pub mod extract;
pub mod fetcher;
pub mod posts;
pub mod rank;
pub mod store;
pub mod sync;
pub mod types;
pub mod utils;
pub mod vote;

pub use channels::ChannelRegistry;
pub use dedup::Deduplicator;
pub use extract::MetadataExtractor;
pub use fetcher::{FeedFetch, HttpFetcher, PageFetch};
pub use posts::{Submission, Submissions};
pub use store::{MemoryStore, PgStore, Store, VoteTarget};
pub use sync::{FeedSynchronizer, SyncReport};
pub use types::{
    Channel, Comment, FeedrankError, FetchConfig, Post, Result, SyncConfig, VoteDirection,
    VoteState,
};
pub use vote::VoteLedger;
