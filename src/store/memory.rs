//! In-memory store backend.
//!
//! Single-mutex implementation of the datastore contract. Every trait method
//! takes the lock once and releases it before returning, so vote transitions
//! serialize exactly like row-locked updates do in Postgres. Used by the
//! integration tests and handy for demos.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::rank;
use crate::store::{NewChannel, Store, VoteOutcome, VoteTarget};
use crate::types::{
    Channel, Comment, FeedrankError, NewPost, Post, Result, VoteDirection, VoteState,
};
use crate::vote::transition;

#[derive(Default)]
struct Inner {
    next_id: i64,
    channels: HashMap<i64, Channel>,
    subscriptions: Vec<(i64, i64)>,
    posts: HashMap<i64, Post>,
    comments: HashMap<i64, Comment>,
    votes: HashMap<(i64, VoteTarget), VoteState>,
    user_votes: HashMap<i64, (i64, i64)>,
    user_posts: HashMap<i64, i64>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    decay_seconds: f64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            decay_seconds: rank::DECAY_SECONDS,
        }
    }

    pub fn with_decay(decay_seconds: f64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            decay_seconds,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-mutation in this process; the
        // test-oriented backend just propagates it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_channel(&self, channel: NewChannel) -> Result<Channel> {
        let mut inner = self.lock();
        if inner.channels.values().any(|c| c.url == channel.url) {
            return Err(FeedrankError::DuplicateEntry);
        }
        let channel_id = inner.next_id();
        let row = Channel {
            channel_id,
            url: channel.url,
            link: channel.link,
            title: channel.title,
            description: channel.description,
            icon_url: channel.icon_url,
            is_default: channel.is_default,
            is_muted: false,
            sync_on: channel.sync_on,
            published: channel.published,
            subscription_count: 0,
            created_on: Utc::now(),
        };
        inner.channels.insert(channel_id, row.clone());
        Ok(row)
    }

    async fn channel(&self, channel_id: i64) -> Result<Channel> {
        self.lock()
            .channels
            .get(&channel_id)
            .cloned()
            .ok_or(FeedrankError::ChannelNotFound(channel_id))
    }

    async fn channel_by_url(&self, url: &str) -> Result<Option<Channel>> {
        Ok(self.lock().channels.values().find(|c| c.url == url).cloned())
    }

    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let mut channels: Vec<Channel> = self.lock().channels.values().cloned().collect();
        channels.sort_by_key(|c| c.channel_id);
        Ok(channels)
    }

    async fn update_channel_sync(
        &self,
        channel_id: i64,
        published: DateTime<Utc>,
        sync_on: DateTime<Utc>,
        details: Option<(Option<String>, Option<String>)>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let channel = inner
            .channels
            .get_mut(&channel_id)
            .ok_or(FeedrankError::ChannelNotFound(channel_id))?;
        channel.published = published;
        channel.sync_on = sync_on;
        if let Some((description, icon_url)) = details {
            channel.description = description;
            channel.icon_url = icon_url;
        }
        Ok(())
    }

    async fn subscribe(&self, channel_id: i64, user_id: i64) -> Result<bool> {
        let mut inner = self.lock();
        if !inner.channels.contains_key(&channel_id) {
            return Err(FeedrankError::ChannelNotFound(channel_id));
        }
        if inner.subscriptions.contains(&(channel_id, user_id)) {
            return Ok(false);
        }
        inner.subscriptions.push((channel_id, user_id));
        if let Some(channel) = inner.channels.get_mut(&channel_id) {
            channel.subscription_count += 1;
        }
        Ok(true)
    }

    async fn unsubscribe(&self, channel_id: i64, user_id: i64) -> Result<bool> {
        let mut inner = self.lock();
        let before = inner.subscriptions.len();
        inner
            .subscriptions
            .retain(|&(c, u)| !(c == channel_id && u == user_id));
        let removed = inner.subscriptions.len() < before;
        if removed {
            if let Some(channel) = inner.channels.get_mut(&channel_id) {
                channel.subscription_count -= 1;
            }
        }
        Ok(removed)
    }

    async fn post_exists(&self, channel_id: i64, guid: i64, title: &str) -> Result<bool> {
        Ok(self.lock().posts.values().any(|p| {
            p.channel_id == Some(channel_id) && (p.guid == guid || p.title == title)
        }))
    }

    async fn insert_post(&self, post: NewPost) -> Result<Post> {
        let mut inner = self.lock();
        let collision = inner.posts.values().any(|p| {
            p.channel_id == post.channel_id && p.user_id == post.user_id && p.link == post.link
        });
        if collision {
            return Err(FeedrankError::DuplicateEntry);
        }
        if let Some(user_id) = post.user_id {
            *inner.user_posts.entry(user_id).or_insert(0) += 1;
        }
        let post_id = inner.next_id();
        let row = Post {
            post_id,
            channel_id: post.channel_id,
            user_id: post.user_id,
            guid: post.guid,
            title: post.title,
            description: post.description,
            slug: post.slug,
            link: post.link,
            img_url: post.img_url,
            img_alt: post.img_alt,
            vid_url: post.vid_url,
            vid_type: post.vid_type,
            author: post.author,
            published: post.published,
            up_votes: 0,
            down_votes: 0,
            votes: 0,
            rank: post.rank,
            tags: post.tags,
            comment_count: 0,
            is_muted: false,
            created_on: Utc::now(),
        };
        inner.posts.insert(post_id, row.clone());
        Ok(row)
    }

    async fn post(&self, post_id: i64) -> Result<Post> {
        self.lock()
            .posts
            .get(&post_id)
            .cloned()
            .ok_or(FeedrankError::PostNotFound(post_id))
    }

    async fn posts_for_channel(&self, channel_id: i64) -> Result<Vec<Post>> {
        let mut posts: Vec<Post> = self
            .lock()
            .posts
            .values()
            .filter(|p| p.channel_id == Some(channel_id))
            .cloned()
            .collect();
        posts.sort_by_key(|p| p.post_id);
        Ok(posts)
    }

    async fn insert_comment(
        &self,
        post_id: i64,
        user_id: i64,
        reply_to: Option<i64>,
        text: &str,
    ) -> Result<Comment> {
        let mut inner = self.lock();
        if !inner.posts.contains_key(&post_id) {
            return Err(FeedrankError::PostNotFound(post_id));
        }
        if let Some(parent_id) = reply_to {
            let parent = inner
                .comments
                .get_mut(&parent_id)
                .ok_or(FeedrankError::CommentNotFound(parent_id))?;
            parent.reply_count += 1;
        }
        if let Some(post) = inner.posts.get_mut(&post_id) {
            post.comment_count += 1;
        }
        let comment_id = inner.next_id();
        let row = Comment {
            comment_id,
            post_id,
            reply_to,
            user_id,
            comment_text: text.to_string(),
            up_votes: 0,
            down_votes: 0,
            votes: 0,
            rank: rank::comment_rank(0, 0),
            reply_count: 0,
            is_muted: false,
            created_on: Utc::now(),
        };
        inner.comments.insert(comment_id, row.clone());
        Ok(row)
    }

    async fn comment(&self, comment_id: i64) -> Result<Comment> {
        self.lock()
            .comments
            .get(&comment_id)
            .cloned()
            .ok_or(FeedrankError::CommentNotFound(comment_id))
    }

    async fn vote_state(&self, user_id: i64, target: VoteTarget) -> Result<Option<VoteState>> {
        Ok(self.lock().votes.get(&(user_id, target)).copied())
    }

    async fn apply_vote(
        &self,
        user_id: i64,
        target: VoteTarget,
        direction: VoteDirection,
    ) -> Result<VoteOutcome> {
        // The single lock makes the whole transition atomic: the vote row,
        // the voter's counters, the target's aggregates, and the rank all
        // move together or the method errors without touching anything.
        let mut inner = self.lock();
        match target {
            VoteTarget::Post(post_id) if !inner.posts.contains_key(&post_id) => {
                return Err(FeedrankError::PostNotFound(post_id));
            }
            VoteTarget::Comment(comment_id) if !inner.comments.contains_key(&comment_id) => {
                return Err(FeedrankError::CommentNotFound(comment_id));
            }
            _ => {}
        }

        let current = inner.votes.get(&(user_id, target)).copied();
        let step = transition(current, direction);

        inner.votes.insert((user_id, target), step.new_state);
        let counters = inner.user_votes.entry(user_id).or_insert((0, 0));
        counters.0 += step.up_delta;
        counters.1 += step.down_delta;

        match target {
            VoteTarget::Post(post_id) => {
                let decay = self.decay_seconds;
                if let Some(post) = inner.posts.get_mut(&post_id) {
                    post.up_votes += step.up_delta;
                    post.down_votes += step.down_delta;
                    post.votes = post.up_votes - post.down_votes;
                    post.rank =
                        rank::post_rank(post.up_votes, post.down_votes, post.created_on, decay);
                }
            }
            VoteTarget::Comment(comment_id) => {
                if let Some(comment) = inner.comments.get_mut(&comment_id) {
                    comment.up_votes += step.up_delta;
                    comment.down_votes += step.down_delta;
                    comment.votes = comment.up_votes - comment.down_votes;
                    comment.rank = rank::comment_rank(comment.up_votes, comment.down_votes);
                }
            }
        }

        Ok(VoteOutcome {
            new_state: step.new_state,
            net_delta: step.net_delta(),
        })
    }

    async fn user_vote_counters(&self, user_id: i64) -> Result<(i64, i64)> {
        Ok(self
            .lock()
            .user_votes
            .get(&user_id)
            .copied()
            .unwrap_or((0, 0)))
    }

    async fn user_post_count(&self, user_id: i64) -> Result<i64> {
        Ok(self.lock().user_posts.get(&user_id).copied().unwrap_or(0))
    }
}
