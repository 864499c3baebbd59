//! RPC message shapes exchanged between nodes.

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::membership::Membership;
use crate::types::{LogIndex, NodeId, ReadSeq, Term};

/// RequestVote RPC arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments. An empty `entries` is a heartbeat.
///
/// `read_seq` is the newest read sequence the leader has issued; followers
/// echo it back on success so the leader can confirm its authority for
/// pending strong reads without appending to the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntries<C> {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry<C>>,
    pub leader_commit: LogIndex,
    pub read_seq: ReadSeq,
}

/// AppendEntries RPC response.
///
/// On rejection the conflict fields let the leader skip whole mismatched
/// terms instead of walking back one index per round trip: `conflict_term`
/// is the term found at the leader's `prev_log_index` (when one exists) and
/// `conflict_index` is the first index of that term, or one past the
/// follower's last entry when the follower's log is simply short.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
    pub conflict_index: LogIndex,
    pub conflict_term: Option<Term>,
    pub read_seq: ReadSeq,
}

/// InstallSnapshot RPC arguments: the leader's fallback when a follower
/// needs entries older than the leader's compaction boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshot {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub membership: Membership,
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub match_index: LogIndex,
}

/// Every message the protocol exchanges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message<C> {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries<C>),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshot),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl<C> Message<C> {
    /// The term the message carries; every message has one.
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteResponse(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesResponse(m) => m.term,
            Message::InstallSnapshot(m) => m.term,
            Message::InstallSnapshotResponse(m) => m.term,
        }
    }
}
