//! Write/read quorum sizing and acknowledgment evaluation.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::membership::Membership;
use crate::types::NodeId;

/// How many acknowledgments an operation needs, relative to a voter set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumSize {
    /// `floor(N/2) + 1`, the classic consensus quorum.
    Majority,
    /// Every voter must acknowledge.
    All,
    /// A fixed count, clamped to `1..=N` when resolved.
    Fixed(u32),
}

impl QuorumSize {
    /// Resolve to a concrete acknowledgment count for a set of `n` voters.
    pub fn required(self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        match self {
            QuorumSize::Majority => n / 2 + 1,
            QuorumSize::All => n,
            QuorumSize::Fixed(k) => (k as usize).clamp(1, n),
        }
    }
}

impl fmt::Display for QuorumSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumSize::Majority => write!(f, "majority"),
            QuorumSize::All => write!(f, "all"),
            QuorumSize::Fixed(k) => write!(f, "{k}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid quorum size '{0}': expected 'majority', 'all', or a positive integer")]
pub struct ParseQuorumError(String);

impl FromStr for QuorumSize {
    type Err = ParseQuorumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "majority" => Ok(QuorumSize::Majority),
            "all" => Ok(QuorumSize::All),
            other => match other.parse::<u32>() {
                Ok(k) if k > 0 => Ok(QuorumSize::Fixed(k)),
                _ => Err(ParseQuorumError(s.to_string())),
            },
        }
    }
}

/// The cluster's write and read quorum configuration.
///
/// The default (`W = R = majority`) guarantees that every read quorum
/// intersects every write quorum. Asymmetric settings are legitimate tuning
/// knobs: `W = all, R = 1` favors reads, and `W = 1, R = all` favors writes.
/// Any configuration with `W + R <= N` gives up read-after-write consistency
/// in exchange for latency and availability. Callers choosing a sub-threshold
/// configuration should check [`QuorumPolicy::overlap_guaranteed`] and surface
/// the trade-off to their own users; the policy accepts it without complaint.
///
/// Elections are deliberately outside this policy: leader election always
/// demands a strict majority (see [`Membership::election_won`]) no matter
/// how W and R are tuned, which is what keeps a term from having two leaders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPolicy {
    pub write: QuorumSize,
    pub read: QuorumSize,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self {
            write: QuorumSize::Majority,
            read: QuorumSize::Majority,
        }
    }
}

impl QuorumPolicy {
    /// Acknowledgments needed to commit a write in a set of `n` voters.
    pub fn write_required(&self, n: usize) -> usize {
        self.write.required(n)
    }

    /// Acknowledgments needed to satisfy a strong read in a set of `n` voters.
    pub fn read_required(&self, n: usize) -> usize {
        self.read.required(n)
    }

    /// Whether `acks` acknowledgments commit a write against `n` voters.
    pub fn write_satisfied(&self, acks: usize, n: usize) -> bool {
        acks >= self.write_required(n)
    }

    /// Whether `acks` acknowledgments satisfy a strong read against `n` voters.
    pub fn read_satisfied(&self, acks: usize, n: usize) -> bool {
        acks >= self.read_required(n)
    }

    /// True iff `W + R > N`: every read quorum overlaps every write quorum
    /// by at least one node, the condition for read-after-write consistency.
    pub fn overlap_guaranteed(&self, n: usize) -> bool {
        self.write_required(n) + self.read_required(n) > n
    }

    /// Whether the nodes in `acked` commit a write under `membership`.
    ///
    /// While the membership is joint, the write quorum must be met in the old
    /// and the new voter set independently; acknowledgments from nodes
    /// outside a set do not count toward it.
    pub fn write_satisfied_in(&self, acked: &BTreeSet<NodeId>, membership: &Membership) -> bool {
        self.satisfied_in(self.write, acked, membership)
    }

    /// Whether the nodes in `acked` satisfy a strong read under `membership`.
    pub fn read_satisfied_in(&self, acked: &BTreeSet<NodeId>, membership: &Membership) -> bool {
        self.satisfied_in(self.read, acked, membership)
    }

    fn satisfied_in(
        &self,
        size: QuorumSize,
        acked: &BTreeSet<NodeId>,
        membership: &Membership,
    ) -> bool {
        let in_voters = membership.voters().intersection(acked).count();
        if in_voters < size.required(membership.voters().len()) {
            return false;
        }
        if membership.is_joint() {
            let in_next = membership.next_voters().intersection(acked).count();
            if in_next < size.required(membership.next_voters().len()) {
                return false;
            }
        }
        true
    }
}
