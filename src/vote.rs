//! Tri-state vote ledger.
//!
//! The transition table is a pure function; backends invoke it inside their
//! transaction so the vote row, the voter's lifetime counters, the target's
//! aggregates, and the rank all move together.

use std::sync::Arc;
use tracing::warn;

use crate::store::{Store, VoteOutcome, VoteTarget};
use crate::types::{FeedrankError, Result, VoteDirection, VoteState};

/// How often a lost counter race is retried before surfacing to the caller.
pub const MAX_CONFLICT_RETRIES: u32 = 3;

/// One step of the tri-state vote state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub new_state: VoteState,
    /// Applied to both the target's and the voter's up counters.
    pub up_delta: i64,
    pub down_delta: i64,
}

impl Transition {
    /// Signed change in (up - down).
    pub fn net_delta(&self) -> i64 {
        self.up_delta - self.down_delta
    }
}

/// Maps (current stored value, requested direction) onto the next state.
///
/// A repeated vote in the same direction toggles back to neutral; a vote in
/// the opposite direction flips, moving both counters. A missing row counts
/// as neutral here; the distinction only matters for reads.
pub fn transition(current: Option<VoteState>, direction: VoteDirection) -> Transition {
    let current = current.unwrap_or(VoteState::Neutral);
    match (current, direction) {
        (VoteState::Neutral, VoteDirection::Up) => Transition {
            new_state: VoteState::Up,
            up_delta: 1,
            down_delta: 0,
        },
        (VoteState::Neutral, VoteDirection::Down) => Transition {
            new_state: VoteState::Down,
            up_delta: 0,
            down_delta: 1,
        },
        (VoteState::Up, VoteDirection::Up) => Transition {
            new_state: VoteState::Neutral,
            up_delta: -1,
            down_delta: 0,
        },
        (VoteState::Up, VoteDirection::Down) => Transition {
            new_state: VoteState::Down,
            up_delta: -1,
            down_delta: 1,
        },
        (VoteState::Down, VoteDirection::Up) => Transition {
            new_state: VoteState::Up,
            up_delta: 1,
            down_delta: -1,
        },
        (VoteState::Down, VoteDirection::Down) => Transition {
            new_state: VoteState::Neutral,
            up_delta: 0,
            down_delta: -1,
        },
    }
}

/// Records votes and keeps aggregates consistent.
pub struct VoteLedger {
    store: Arc<dyn Store>,
}

impl VoteLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Applies one vote for an authenticated user, retrying lost counter
    /// races a bounded number of times.
    ///
    /// `voter` is `None` for anonymous callers, which are rejected before any
    /// transition begins.
    pub async fn vote(
        &self,
        voter: Option<i64>,
        target: VoteTarget,
        direction: VoteDirection,
    ) -> Result<VoteOutcome> {
        let user_id = voter.ok_or(FeedrankError::VoteRejected)?;

        let mut attempts = 0;
        loop {
            match self.store.apply_vote(user_id, target, direction).await {
                Err(FeedrankError::TransactionConflict) if attempts < MAX_CONFLICT_RETRIES => {
                    attempts += 1;
                    warn!(user_id, ?target, attempts, "vote transaction conflict, retrying");
                }
                other => return other,
            }
        }
    }

    /// Current stored vote of a user on a target.
    pub async fn vote_state(&self, user_id: i64, target: VoteTarget) -> Result<Option<VoteState>> {
        self.store.vote_state(user_id, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_up_vote() {
        let t = transition(None, VoteDirection::Up);
        assert_eq!(t.new_state, VoteState::Up);
        assert_eq!((t.up_delta, t.down_delta), (1, 0));
        assert_eq!(t.net_delta(), 1);
    }

    #[test]
    fn fresh_down_vote() {
        let t = transition(None, VoteDirection::Down);
        assert_eq!(t.new_state, VoteState::Down);
        assert_eq!(t.net_delta(), -1);
    }

    #[test]
    fn up_toggles_off() {
        let t = transition(Some(VoteState::Up), VoteDirection::Up);
        assert_eq!(t.new_state, VoteState::Neutral);
        assert_eq!((t.up_delta, t.down_delta), (-1, 0));
        assert_eq!(t.net_delta(), -1);
    }

    #[test]
    fn down_toggles_off() {
        let t = transition(Some(VoteState::Down), VoteDirection::Down);
        assert_eq!(t.new_state, VoteState::Neutral);
        assert_eq!(t.net_delta(), 1);
    }

    #[test]
    fn up_flips_to_down_moves_two() {
        let t = transition(Some(VoteState::Up), VoteDirection::Down);
        assert_eq!(t.new_state, VoteState::Down);
        assert_eq!((t.up_delta, t.down_delta), (-1, 1));
        assert_eq!(t.net_delta(), -2);
    }

    #[test]
    fn down_flips_to_up_moves_two() {
        let t = transition(Some(VoteState::Down), VoteDirection::Up);
        assert_eq!(t.new_state, VoteState::Up);
        assert_eq!(t.net_delta(), 2);
    }

    #[test]
    fn retracted_behaves_like_fresh() {
        let retracted = transition(Some(VoteState::Neutral), VoteDirection::Up);
        let fresh = transition(None, VoteDirection::Up);
        assert_eq!(retracted, fresh);
    }

    #[test]
    fn toggle_round_trip_sums_to_zero() {
        let first = transition(None, VoteDirection::Up);
        let second = transition(Some(first.new_state), VoteDirection::Up);
        assert_eq!(first.net_delta() + second.net_delta(), 0);
    }
}
