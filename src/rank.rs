//! Rank computation for posts and comments.
//!
//! The hot rank orders posts across time: it grows with net score and with
//! recency, so two posts with equal scores sort newest-first. The Wilson
//! rating is a separate display value ("how sure are we this is liked") and
//! is never used as a sort key.

use chrono::{DateTime, Utc};

/// Default divisor applied to the creation timestamp. Roughly 12.5 hours of
/// recency per order of magnitude of net score.
pub const DECAY_SECONDS: f64 = 45_000.0;

/// z for a 95% confidence interval.
const WILSON_Z: f64 = 1.96;

/// Hot rank for a post.
///
/// `sign(net) * log10(max(|net|, 1)) + created_epoch_seconds / decay`.
/// Monotonically non-decreasing in `up - down` for a fixed creation time, and
/// increasing in recency for a fixed score. Deterministic: no clock reads.
pub fn post_rank(up_votes: i64, down_votes: i64, created_on: DateTime<Utc>, decay_seconds: f64) -> f64 {
    score_magnitude(up_votes - down_votes) + created_on.timestamp() as f64 / decay_seconds
}

/// Hot rank with the default decay divisor.
pub fn post_rank_default(up_votes: i64, down_votes: i64, created_on: DateTime<Utc>) -> f64 {
    post_rank(up_votes, down_votes, created_on, DECAY_SECONDS)
}

/// Comment rank: net-score monotonic, no recency term. Comments sort "top
/// within thread" rather than "hot across time".
pub fn comment_rank(up_votes: i64, down_votes: i64) -> f64 {
    score_magnitude(up_votes - down_votes)
}

fn score_magnitude(net: i64) -> f64 {
    let magnitude = (net.abs().max(1) as f64).log10();
    magnitude * net.signum() as f64
}

/// Wilson score interval lower bound at 95% confidence, in [0, 1].
///
/// Answers "how confident are we that this is liked", independent of vote
/// volume inflation. Zero when there are no votes.
pub fn rating(up_votes: i64, down_votes: i64) -> f64 {
    let n = (up_votes + down_votes) as f64;
    if n <= 0.0 {
        return 0.0;
    }
    let phat = up_votes as f64 / n;
    let z = WILSON_Z;
    let z2 = z * z;
    let center = phat + z2 / (2.0 * n);
    let margin = z * ((phat * (1.0 - phat) + z2 / (4.0 * n)) / n).sqrt();
    ((center - margin) / (1.0 + z2 / n)).max(0.0)
}

/// Display rating on a 1-5 scale, floored at 1.
pub fn scaled_rating(up_votes: i64, down_votes: i64) -> f64 {
    (rating(up_votes, down_votes) * 5.0).max(1.0)
}
