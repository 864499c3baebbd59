//! Per-role state. Each variant of [`crate::node::Role`] owns exactly the
//! data that role needs, so demotion drops leader bookkeeping by
//! construction.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::log::{LogEntry, RaftLog};
use crate::membership::Membership;
use crate::quorum::QuorumPolicy;
use crate::types::{LogIndex, NodeId, ReadSeq, RequestId};

/// Followers are passive: they answer RPCs and remember who leads, so client
/// submissions can be redirected.
#[derive(Debug, Default)]
pub struct Follower {
    pub leader_id: Option<NodeId>,
}

impl Follower {
    pub fn new(leader_id: Option<NodeId>) -> Self {
        Self { leader_id }
    }
}

/// A candidate collects votes for the term it started.
#[derive(Debug)]
pub struct Candidate {
    votes: BTreeSet<NodeId>,
}

impl Candidate {
    /// A fresh candidacy; the candidate has already voted for itself.
    pub fn new(self_id: NodeId) -> Self {
        let mut votes = BTreeSet::new();
        votes.insert(self_id);
        Self { votes }
    }

    pub fn record_vote(&mut self, from: NodeId) {
        self.votes.insert(from);
    }

    /// Whether the collected votes win under `membership` (majority of every
    /// voter set).
    pub fn has_won(&self, membership: &Membership) -> bool {
        membership.election_won(&self.votes)
    }
}

/// Replication progress toward one follower.
#[derive(Clone, Copy, Debug)]
pub struct Progress {
    /// Next entry to send. Optimistically one past the leader's last entry.
    pub next: LogIndex,
    /// Highest index known replicated. Conservatively zero, monotone after.
    pub matched: LogIndex,
}

/// A strong read waiting for its quorum round.
#[derive(Debug)]
pub struct PendingRead<C> {
    pub seq: ReadSeq,
    /// Commit index captured when the read arrived; the read is served only
    /// after this index is applied.
    pub read_index: LogIndex,
    pub query: C,
}

/// Volatile leader state, rebuilt at each election and discarded on
/// demotion.
#[derive(Debug)]
pub struct Leader<C> {
    progress: HashMap<NodeId, Progress>,
    /// Index of the no-op this leader appended when it took office. Reads
    /// are gated on it committing, because until then the leader cannot
    /// know the true commit index.
    pub term_start: LogIndex,
    /// Newest read sequence issued; piggybacked on every AppendEntries.
    read_seq: ReadSeq,
    /// Highest sequence each follower has echoed back.
    acked_seq: HashMap<NodeId, ReadSeq>,
    pending_reads: VecDeque<PendingRead<C>>,
    /// Request id -> log index, rebuilt from the log so retried submissions
    /// survive leadership changes for entries that survived replication.
    dedup: HashMap<RequestId, LogIndex>,
}

impl<C> Leader<C> {
    /// Fresh leader state. `term_start` is where this term's no-op will
    /// land; the dedup ledger is rebuilt by scanning the retained log.
    pub fn new(peers: &[NodeId], log: &RaftLog<C>) -> Self {
        let next = log.last_index().next();
        let dedup = dedup_from_entries(log.entries());
        Self {
            progress: peers
                .iter()
                .map(|&p| {
                    (
                        p,
                        Progress {
                            next,
                            matched: LogIndex::ZERO,
                        },
                    )
                })
                .collect(),
            term_start: next,
            read_seq: ReadSeq::NONE,
            acked_seq: HashMap::new(),
            pending_reads: VecDeque::new(),
            dedup,
        }
    }

    pub fn progress(&self, peer: NodeId) -> Option<Progress> {
        self.progress.get(&peer).copied()
    }

    /// Make sure every peer in `peers` is tracked; newcomers (from a config
    /// change) start optimistic like everyone else did at election.
    pub fn ensure_progress(&mut self, peers: &[NodeId], last_log_index: LogIndex) {
        for &p in peers {
            self.progress.entry(p).or_insert(Progress {
                next: last_log_index.next(),
                matched: LogIndex::ZERO,
            });
        }
    }

    /// Record a successful replication ack. `matched` never regresses, so a
    /// reordered stale ack cannot pull progress backward.
    pub fn record_success(&mut self, from: NodeId, match_index: LogIndex) {
        if let Some(p) = self.progress.get_mut(&from) {
            if match_index > p.matched {
                p.matched = match_index;
            }
            let next = match_index.next();
            if next > p.next {
                p.next = next;
            }
        }
    }

    /// Rewind `next` for a follower after a consistency-check rejection.
    pub fn set_next(&mut self, from: NodeId, next: LogIndex) {
        if let Some(p) = self.progress.get_mut(&from) {
            p.next = next;
        }
    }

    /// Nodes whose match index has reached `index`, plus the leader itself.
    pub fn acked_at(&self, index: LogIndex, me: NodeId) -> BTreeSet<NodeId> {
        let mut acked: BTreeSet<NodeId> = self
            .progress
            .iter()
            .filter(|(_, p)| p.matched >= index)
            .map(|(&id, _)| id)
            .collect();
        acked.insert(me);
        acked
    }

    pub fn current_read_seq(&self) -> ReadSeq {
        self.read_seq
    }

    /// Register a strong read captured at `read_index`.
    pub fn issue_read(&mut self, read_index: LogIndex, query: C) -> ReadSeq {
        self.read_seq = self.read_seq.next();
        self.pending_reads.push_back(PendingRead {
            seq: self.read_seq,
            read_index,
            query,
        });
        self.read_seq
    }

    /// Record the read sequence a follower echoed.
    pub fn record_read_ack(&mut self, from: NodeId, seq: ReadSeq) {
        let acked = self.acked_seq.entry(from).or_insert(ReadSeq::NONE);
        if seq > *acked {
            *acked = seq;
        }
    }

    /// Pop every pending read whose quorum round completed and whose
    /// read index has been applied.
    ///
    /// Pending reads are ordered by sequence and their read indexes are
    /// monotone, so checking the front suffices: if it cannot be released,
    /// nothing behind it can.
    pub fn release_reads(
        &mut self,
        me: NodeId,
        last_applied: LogIndex,
        membership: &Membership,
        policy: &QuorumPolicy,
    ) -> Vec<(ReadSeq, C)> {
        let mut released = Vec::new();
        while let Some(front) = self.pending_reads.front() {
            if front.read_index > last_applied {
                break;
            }
            let mut confirmed: BTreeSet<NodeId> = self
                .acked_seq
                .iter()
                .filter(|(_, &acked)| acked >= front.seq)
                .map(|(&id, _)| id)
                .collect();
            confirmed.insert(me);
            if !policy.read_satisfied_in(&confirmed, membership) {
                break;
            }
            if let Some(read) = self.pending_reads.pop_front() {
                released.push((read.seq, read.query));
            }
        }
        released
    }

    /// Look up a previously accepted submission by request id.
    pub fn known_request(&self, id: RequestId) -> Option<LogIndex> {
        self.dedup.get(&id).copied()
    }

    pub fn remember_request(&mut self, id: RequestId, index: LogIndex) {
        self.dedup.insert(id, index);
    }

    /// Drop ids whose entries fell below the compaction boundary. Retries
    /// of those ids will append again; the at-most-once window is the
    /// retained log.
    pub fn forget_through(&mut self, boundary: LogIndex) {
        self.dedup.retain(|_, index| *index > boundary);
    }
}

/// Request id -> index view over a slice of entries.
fn dedup_from_entries<C>(entries: &[LogEntry<C>]) -> HashMap<RequestId, LogIndex> {
    entries
        .iter()
        .filter_map(|e| e.request_id.map(|rid| (rid, e.index)))
        .collect()
}
