//! Postgres store backend.
//!
//! Vote transitions run in one transaction with the target row locked
//! (`SELECT ... FOR UPDATE`), so concurrent votes on the same target
//! serialize at the row and no counter update is lost. Serialization and
//! deadlock failures map to `TransactionConflict` for the ledger to retry.
//!
//! Schema lives in `migrations/`; call [`PgStore::migrate`] (or run
//! `sqlx migrate run`) before serving traffic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::rank;
use crate::store::{NewChannel, Store, VoteOutcome, VoteTarget};
use crate::types::{
    Channel, Comment, FeedrankError, NewPost, Post, Result, VoteDirection, VoteState,
};
use crate::vote::transition;

pub struct PgStore {
    pool: PgPool,
    decay_seconds: f64,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self {
            pool,
            decay_seconds: rank::DECAY_SECONDS,
        })
    }

    pub fn with_decay(mut self, decay_seconds: f64) -> Self {
        self.decay_seconds = decay_seconds;
        self
    }

    /// Applies pending migrations from the embedded `migrations/` directory.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }
}

/// Unique-constraint violations become `DuplicateEntry`; serialization
/// failures and deadlocks become `TransactionConflict`.
fn map_db_error(e: sqlx::Error) -> FeedrankError {
    if let Some(db) = e.as_database_error() {
        match db.code().as_deref() {
            Some("23505") => return FeedrankError::DuplicateEntry,
            Some("40001") | Some("40P01") => return FeedrankError::TransactionConflict,
            _ => {}
        }
    }
    FeedrankError::Database(e)
}

fn channel_from_row(row: &PgRow) -> std::result::Result<Channel, sqlx::Error> {
    Ok(Channel {
        channel_id: row.try_get("channel_id")?,
        url: row.try_get("url")?,
        link: row.try_get("link")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        icon_url: row.try_get("icon_url")?,
        is_default: row.try_get("is_default")?,
        is_muted: row.try_get("is_muted")?,
        sync_on: row.try_get("sync_on")?,
        published: row.try_get("published")?,
        subscription_count: row.try_get("subscription_count")?,
        created_on: row.try_get("created_on")?,
    })
}

fn post_from_row(row: &PgRow) -> std::result::Result<Post, sqlx::Error> {
    Ok(Post {
        post_id: row.try_get("post_id")?,
        channel_id: row.try_get("channel_id")?,
        user_id: row.try_get("user_id")?,
        guid: row.try_get("guid")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        slug: row.try_get("slug")?,
        link: row.try_get("link")?,
        img_url: row.try_get("img_url")?,
        img_alt: row.try_get("img_alt")?,
        vid_url: row.try_get("vid_url")?,
        vid_type: row.try_get("vid_type")?,
        author: row.try_get("author")?,
        published: row.try_get("published")?,
        up_votes: row.try_get("up_votes")?,
        down_votes: row.try_get("down_votes")?,
        votes: row.try_get("votes")?,
        rank: row.try_get("rank")?,
        tags: row.try_get("tags")?,
        comment_count: row.try_get("comment_count")?,
        is_muted: row.try_get("is_muted")?,
        created_on: row.try_get("created_on")?,
    })
}

fn comment_from_row(row: &PgRow) -> std::result::Result<Comment, sqlx::Error> {
    Ok(Comment {
        comment_id: row.try_get("comment_id")?,
        post_id: row.try_get("post_id")?,
        reply_to: row.try_get("reply_to")?,
        user_id: row.try_get("user_id")?,
        comment_text: row.try_get("comment_text")?,
        up_votes: row.try_get("up_votes")?,
        down_votes: row.try_get("down_votes")?,
        votes: row.try_get("votes")?,
        rank: row.try_get("rank")?,
        reply_count: row.try_get("reply_count")?,
        is_muted: row.try_get("is_muted")?,
        created_on: row.try_get("created_on")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn insert_channel(&self, channel: NewChannel) -> Result<Channel> {
        let row = sqlx::query(
            r#"
            INSERT INTO channels (url, link, title, description, icon_url, is_default,
                                  is_muted, sync_on, published, subscription_count, created_on)
            VALUES ($1, $2, $3, $4, $5, $6, false, $7, $8, 0, now())
            RETURNING *
            "#,
        )
        .bind(&channel.url)
        .bind(&channel.link)
        .bind(&channel.title)
        .bind(&channel.description)
        .bind(&channel.icon_url)
        .bind(channel.is_default)
        .bind(channel.sync_on)
        .bind(channel.published)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;

        let created = channel_from_row(&row)?;
        info!(channel_id = created.channel_id, url = %created.url, "registered channel");
        Ok(created)
    }

    async fn channel(&self, channel_id: i64) -> Result<Channel> {
        let row = sqlx::query("SELECT * FROM channels WHERE channel_id = $1")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(FeedrankError::ChannelNotFound(channel_id))?;
        Ok(channel_from_row(&row)?)
    }

    async fn channel_by_url(&self, url: &str) -> Result<Option<Channel>> {
        let row = sqlx::query("SELECT * FROM channels WHERE url = $1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(channel_from_row).transpose()?)
    }

    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query("SELECT * FROM channels ORDER BY channel_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| channel_from_row(row).map_err(FeedrankError::from))
            .collect()
    }

    async fn update_channel_sync(
        &self,
        channel_id: i64,
        published: DateTime<Utc>,
        sync_on: DateTime<Utc>,
        details: Option<(Option<String>, Option<String>)>,
    ) -> Result<()> {
        match details {
            Some((description, icon_url)) => {
                sqlx::query(
                    r#"
                    UPDATE channels
                    SET published = $1, sync_on = $2, description = $3, icon_url = $4
                    WHERE channel_id = $5
                    "#,
                )
                .bind(published)
                .bind(sync_on)
                .bind(description)
                .bind(icon_url)
                .bind(channel_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE channels SET published = $1, sync_on = $2 WHERE channel_id = $3",
                )
                .bind(published)
                .bind(sync_on)
                .bind(channel_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel_id: i64, user_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO subscriptions (channel_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (channel_id, user_id) DO NOTHING
            "#,
        )
        .bind(channel_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE channels SET subscription_count = subscription_count + 1 WHERE channel_id = $1",
        )
        .bind(channel_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn unsubscribe(&self, channel_id: i64, user_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(
            "DELETE FROM subscriptions WHERE channel_id = $1 AND user_id = $2",
        )
        .bind(channel_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if removed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE channels SET subscription_count = subscription_count - 1 WHERE channel_id = $1",
        )
        .bind(channel_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn post_exists(&self, channel_id: i64, guid: i64, title: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS present FROM posts
            WHERE channel_id = $1 AND (guid = $2 OR title = $3)
            LIMIT 1
            "#,
        )
        .bind(channel_id)
        .bind(guid)
        .bind(title)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn insert_post(&self, post: NewPost) -> Result<Post> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        let row = sqlx::query(
            r#"
            INSERT INTO posts (channel_id, user_id, guid, title, description, slug, link,
                               img_url, img_alt, vid_url, vid_type, author, published,
                               up_votes, down_votes, votes, rank, tags, comment_count,
                               is_muted, created_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    0, 0, 0, $14, $15, 0, false, now())
            RETURNING *
            "#,
        )
        .bind(post.channel_id)
        .bind(post.user_id)
        .bind(post.guid)
        .bind(&post.title)
        .bind(&post.description)
        .bind(&post.slug)
        .bind(&post.link)
        .bind(&post.img_url)
        .bind(&post.img_alt)
        .bind(&post.vid_url)
        .bind(&post.vid_type)
        .bind(&post.author)
        .bind(post.published)
        .bind(post.rank)
        .bind(&post.tags)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;

        if let Some(user_id) = post.user_id {
            sqlx::query("UPDATE users SET post_count = post_count + 1 WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;
        }
        tx.commit().await.map_err(map_db_error)?;
        Ok(post_from_row(&row)?)
    }

    async fn post(&self, post_id: i64) -> Result<Post> {
        let row = sqlx::query("SELECT * FROM posts WHERE post_id = $1")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(FeedrankError::PostNotFound(post_id))?;
        Ok(post_from_row(&row)?)
    }

    async fn posts_for_channel(&self, channel_id: i64) -> Result<Vec<Post>> {
        let rows = sqlx::query("SELECT * FROM posts WHERE channel_id = $1 ORDER BY post_id")
            .bind(channel_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| post_from_row(row).map_err(FeedrankError::from))
            .collect()
    }

    async fn insert_comment(
        &self,
        post_id: i64,
        user_id: i64,
        reply_to: Option<i64>,
        text: &str,
    ) -> Result<Comment> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        let bumped = sqlx::query(
            "UPDATE posts SET comment_count = comment_count + 1 WHERE post_id = $1",
        )
        .bind(post_id)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?
        .rows_affected();
        if bumped == 0 {
            return Err(FeedrankError::PostNotFound(post_id));
        }

        if let Some(parent_id) = reply_to {
            let parent = sqlx::query(
                "UPDATE comments SET reply_count = reply_count + 1 WHERE comment_id = $1",
            )
            .bind(parent_id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?
            .rows_affected();
            if parent == 0 {
                return Err(FeedrankError::CommentNotFound(parent_id));
            }
        }

        let row = sqlx::query(
            r#"
            INSERT INTO comments (post_id, reply_to, user_id, comment_text,
                                  up_votes, down_votes, votes, rank, reply_count,
                                  is_muted, created_on)
            VALUES ($1, $2, $3, $4, 0, 0, 0, 0, 0, false, now())
            RETURNING *
            "#,
        )
        .bind(post_id)
        .bind(reply_to)
        .bind(user_id)
        .bind(text)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;

        tx.commit().await.map_err(map_db_error)?;
        Ok(comment_from_row(&row)?)
    }

    async fn comment(&self, comment_id: i64) -> Result<Comment> {
        let row = sqlx::query("SELECT * FROM comments WHERE comment_id = $1")
            .bind(comment_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(FeedrankError::CommentNotFound(comment_id))?;
        Ok(comment_from_row(&row)?)
    }

    async fn vote_state(&self, user_id: i64, target: VoteTarget) -> Result<Option<VoteState>> {
        let row = match target {
            VoteTarget::Post(post_id) => {
                sqlx::query("SELECT vote FROM post_votes WHERE post_id = $1 AND user_id = $2")
                    .bind(post_id)
                    .bind(user_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            VoteTarget::Comment(comment_id) => sqlx::query(
                "SELECT vote FROM comment_votes WHERE comment_id = $1 AND user_id = $2",
            )
            .bind(comment_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?,
        };
        Ok(row
            .map(|r| r.try_get::<i32, _>("vote"))
            .transpose()?
            .map(VoteState::from_value))
    }

    async fn apply_vote(
        &self,
        user_id: i64,
        target: VoteTarget,
        direction: VoteDirection,
    ) -> Result<VoteOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        let step = match target {
            VoteTarget::Post(post_id) => {
                // Lock the target row first; the vote row and counters follow
                // under the same lock ordering on every path.
                let post = sqlx::query(
                    "SELECT up_votes, down_votes, created_on FROM posts WHERE post_id = $1 FOR UPDATE",
                )
                .bind(post_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_db_error)?
                .ok_or(FeedrankError::PostNotFound(post_id))?;

                let current = sqlx::query(
                    "SELECT vote FROM post_votes WHERE post_id = $1 AND user_id = $2 FOR UPDATE",
                )
                .bind(post_id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_db_error)?
                .map(|r| r.try_get::<i32, _>("vote"))
                .transpose()?
                .map(VoteState::from_value);

                let step = transition(current, direction);

                sqlx::query(
                    r#"
                    INSERT INTO post_votes (post_id, user_id, vote)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (post_id, user_id) DO UPDATE SET vote = EXCLUDED.vote
                    "#,
                )
                .bind(post_id)
                .bind(user_id)
                .bind(step.new_state.value())
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;

                let up: i64 = post.try_get::<i64, _>("up_votes")? + step.up_delta;
                let down: i64 = post.try_get::<i64, _>("down_votes")? + step.down_delta;
                let created_on: DateTime<Utc> = post.try_get("created_on")?;
                let new_rank = rank::post_rank(up, down, created_on, self.decay_seconds);

                sqlx::query(
                    r#"
                    UPDATE posts
                    SET up_votes = $1, down_votes = $2, votes = $1 - $2, rank = $3
                    WHERE post_id = $4
                    "#,
                )
                .bind(up)
                .bind(down)
                .bind(new_rank)
                .bind(post_id)
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;

                step
            }
            VoteTarget::Comment(comment_id) => {
                let comment = sqlx::query(
                    "SELECT up_votes, down_votes FROM comments WHERE comment_id = $1 FOR UPDATE",
                )
                .bind(comment_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_db_error)?
                .ok_or(FeedrankError::CommentNotFound(comment_id))?;

                let current = sqlx::query(
                    "SELECT vote FROM comment_votes WHERE comment_id = $1 AND user_id = $2 FOR UPDATE",
                )
                .bind(comment_id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_db_error)?
                .map(|r| r.try_get::<i32, _>("vote"))
                .transpose()?
                .map(VoteState::from_value);

                let step = transition(current, direction);

                sqlx::query(
                    r#"
                    INSERT INTO comment_votes (comment_id, user_id, vote)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (comment_id, user_id) DO UPDATE SET vote = EXCLUDED.vote
                    "#,
                )
                .bind(comment_id)
                .bind(user_id)
                .bind(step.new_state.value())
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;

                let up: i64 = comment.try_get::<i64, _>("up_votes")? + step.up_delta;
                let down: i64 = comment.try_get::<i64, _>("down_votes")? + step.down_delta;
                let new_rank = rank::comment_rank(up, down);

                sqlx::query(
                    r#"
                    UPDATE comments
                    SET up_votes = $1, down_votes = $2, votes = $1 - $2, rank = $3
                    WHERE comment_id = $4
                    "#,
                )
                .bind(up)
                .bind(down)
                .bind(new_rank)
                .bind(comment_id)
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;

                step
            }
        };

        sqlx::query(
            "UPDATE users SET up_votes = up_votes + $1, down_votes = down_votes + $2 WHERE user_id = $3",
        )
        .bind(step.up_delta)
        .bind(step.down_delta)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

        tx.commit().await.map_err(map_db_error)?;

        Ok(VoteOutcome {
            new_state: step.new_state,
            net_delta: step.net_delta(),
        })
    }

    async fn user_vote_counters(&self, user_id: i64) -> Result<(i64, i64)> {
        let row = sqlx::query("SELECT up_votes, down_votes FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(FeedrankError::UserNotFound(user_id))?;
        Ok((row.try_get("up_votes")?, row.try_get("down_votes")?))
    }

    async fn user_post_count(&self, user_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT post_count FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(FeedrankError::UserNotFound(user_id))?;
        Ok(row.try_get("post_count")?)
    }
}
