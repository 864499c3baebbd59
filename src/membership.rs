//! Cluster membership, including the joint form used during reconfiguration.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// The set of voting members, versioned so replicas can tell configurations
/// apart.
///
/// A membership is either *simple* (`next_voters` empty) or *joint*: during a
/// reconfiguration the old voter set stays in `voters` while the target set
/// sits in `next_voters`, and every election and commit decision must reach
/// quorum in both sets until the transition completes. At most one
/// reconfiguration is in flight at a time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    voters: BTreeSet<NodeId>,
    next_voters: BTreeSet<NodeId>,
    version: u64,
}

impl Membership {
    /// A simple (non-joint) membership over the given voters.
    pub fn new(voters: BTreeSet<NodeId>) -> Self {
        Self {
            voters,
            next_voters: BTreeSet::new(),
            version: 0,
        }
    }

    pub fn voters(&self) -> &BTreeSet<NodeId> {
        &self.voters
    }

    pub fn next_voters(&self) -> &BTreeSet<NodeId> {
        &self.next_voters
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_joint(&self) -> bool {
        !self.next_voters.is_empty()
    }

    /// True if `id` votes in this configuration (either set while joint).
    pub fn is_voter(&self, id: NodeId) -> bool {
        self.voters.contains(&id) || self.next_voters.contains(&id)
    }

    /// Every node that participates in replication: the union of both sets.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        self.voters.union(&self.next_voters).copied().collect()
    }

    /// All nodes except `me`, in stable order. The leader's broadcast targets.
    pub fn peers(&self, me: NodeId) -> Vec<NodeId> {
        self.all_nodes().into_iter().filter(|&n| n != me).collect()
    }

    /// Begin a transition toward `new_voters`: the result is joint over the
    /// current voters and the target set.
    pub fn enter_joint(&self, new_voters: BTreeSet<NodeId>) -> Membership {
        Membership {
            voters: self.voters.clone(),
            next_voters: new_voters,
            version: self.version + 1,
        }
    }

    /// Complete a transition: the target set becomes the sole voter set.
    /// Returns an unchanged clone when not joint.
    pub fn leave_joint(&self) -> Membership {
        if !self.is_joint() {
            return self.clone();
        }
        Membership {
            voters: self.next_voters.clone(),
            next_voters: BTreeSet::new(),
            version: self.version + 1,
        }
    }

    /// Whether `votes` wins an election under this configuration.
    ///
    /// Elections always require a strict majority of each voter set; the
    /// write/read quorum knobs never apply here, otherwise two leaders could
    /// coexist in one term. Votes from nodes outside a set do not count
    /// toward that set.
    pub fn election_won(&self, votes: &BTreeSet<NodeId>) -> bool {
        majority_of(&self.voters, votes)
            && (!self.is_joint() || majority_of(&self.next_voters, votes))
    }
}

fn majority_of(set: &BTreeSet<NodeId>, votes: &BTreeSet<NodeId>) -> bool {
    if set.is_empty() {
        return true;
    }
    let granted = set.intersection(votes).count();
    granted >= set.len() / 2 + 1
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}{{", self.version)?;
        for (i, id) in self.voters.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{id}")?;
        }
        write!(f, "}}")?;
        if self.is_joint() {
            write!(f, "->{{")?;
            for (i, id) in self.next_voters.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{id}")?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[u64]) -> BTreeSet<NodeId> {
        values.iter().map(|&v| NodeId::from(v)).collect()
    }

    #[test]
    fn simple_membership_majority() {
        let m = Membership::new(ids(&[1, 2, 3]));

        assert!(!m.election_won(&ids(&[1])));
        assert!(m.election_won(&ids(&[1, 2])));
        assert!(m.election_won(&ids(&[1, 2, 3])));
    }

    #[test]
    fn joint_requires_both_majorities() {
        let m = Membership::new(ids(&[1, 2, 3])).enter_joint(ids(&[3, 4, 5]));

        // Majority of old only.
        assert!(!m.election_won(&ids(&[1, 2])));
        // Majority of new only.
        assert!(!m.election_won(&ids(&[4, 5])));
        // Node 3 bridges both sets; {2, 3, 4} is a majority of each.
        assert!(m.election_won(&ids(&[2, 3, 4])));
    }

    #[test]
    fn votes_from_outsiders_do_not_count() {
        let m = Membership::new(ids(&[1, 2, 3]));

        assert!(!m.election_won(&ids(&[1, 8, 9])));
    }

    #[test]
    fn enter_and_leave_joint() {
        let m = Membership::new(ids(&[1, 2, 3]));
        assert!(!m.is_joint());

        let joint = m.enter_joint(ids(&[2, 3, 4]));
        assert!(joint.is_joint());
        assert_eq!(joint.version(), 1);
        assert_eq!(joint.all_nodes(), ids(&[1, 2, 3, 4]));
        assert!(joint.is_voter(NodeId::from(4)));

        let done = joint.leave_joint();
        assert!(!done.is_joint());
        assert_eq!(done.version(), 2);
        assert_eq!(*done.voters(), ids(&[2, 3, 4]));
        assert!(!done.is_voter(NodeId::from(1)));
    }

    #[test]
    fn peers_exclude_self() {
        let m = Membership::new(ids(&[1, 2, 3]));

        assert_eq!(
            m.peers(NodeId::from(2)),
            vec![NodeId::from(1), NodeId::from(3)]
        );
    }

    #[test]
    fn display_forms() {
        let m = Membership::new(ids(&[1, 2]));
        assert_eq!(m.to_string(), "v0{N1 N2}");

        let joint = m.enter_joint(ids(&[2, 3]));
        assert_eq!(joint.to_string(), "v1{N1 N2}->{N2 N3}");
    }
}
