//! Term tracking and the single-vote-per-term rule.

use crate::types::{NodeId, Term};

/// Outcome of comparing a remote term against the local one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermCheck {
    /// Remote term is lower; the triggering message is stale and must be
    /// ignored beyond replying with the current term.
    Stale,
    /// Remote term equals the local term.
    Current,
    /// Remote term was higher and has been adopted; the vote record was
    /// cleared and the caller must revert to follower and persist the new
    /// hard state before sending any reply.
    Advanced,
}

/// The node's logical clock: current term plus the vote cast in it.
///
/// Both fields together form the hard state that must reach stable storage
/// before any reply that acknowledges the term or promises the vote. The
/// clock itself never persists anything; every mutation obligates the caller
/// to emit a save action ahead of its sends.
#[derive(Clone, Debug)]
pub struct TermClock {
    current: Term,
    voted_for: Option<NodeId>,
}

impl TermClock {
    pub fn new() -> Self {
        Self {
            current: Term::ZERO,
            voted_for: None,
        }
    }

    /// Rebuild from persisted hard state.
    pub fn restore(current: Term, voted_for: Option<NodeId>) -> Self {
        Self { current, voted_for }
    }

    pub fn current(&self) -> Term {
        self.current
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Compare a remote term against ours, adopting it if higher.
    ///
    /// Adoption clears the vote record: a vote belongs to exactly one term.
    pub fn observe(&mut self, remote: Term) -> TermCheck {
        if remote < self.current {
            TermCheck::Stale
        } else if remote == self.current {
            TermCheck::Current
        } else {
            self.current = remote;
            self.voted_for = None;
            TermCheck::Advanced
        }
    }

    /// Start a new election: bump the term and vote for ourselves.
    /// Returns the new term.
    pub fn begin_election(&mut self, myself: NodeId) -> Term {
        self.current = self.current.increment();
        self.voted_for = Some(myself);
        self.current
    }

    /// Try to record a vote for `candidate` in the current term.
    ///
    /// Returns true if the vote is held by `candidate` afterwards, whether
    /// freshly granted or already granted to the same candidate (so a
    /// duplicated RequestVote is answered consistently). A vote already held
    /// by a different candidate is never overwritten.
    pub fn record_vote(&mut self, candidate: NodeId) -> bool {
        match self.voted_for {
            None => {
                self.voted_for = Some(candidate);
                true
            }
            Some(existing) => existing == candidate,
        }
    }
}

impl Default for TermClock {
    fn default() -> Self {
        Self::new()
    }
}
