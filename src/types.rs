//! Core identifier and counter types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonically increasing term number.
///
/// Terms act as logical clocks and are used to detect stale leaders,
/// candidates, and messages. Term 0 is the state before any election.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Self = Self(0);

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn increment(self) -> Term {
        Term(self.0.saturating_add(1))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Term(value)
    }
}

/// 1-based index into the replicated log.
///
/// Index 0 represents "no entries" or "before the first entry".
/// Valid log entries start at index 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: Self = Self(0);

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Create from array length (0-based length becomes 1-based index).
    pub fn from_length(len: usize) -> LogIndex {
        LogIndex(len as u64)
    }

    pub fn next(self) -> LogIndex {
        LogIndex(self.0.saturating_add(1))
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 == 0 {
            None
        } else {
            Some(LogIndex(self.0 - 1))
        }
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        LogIndex(value)
    }
}

/// Unique server identifier. Assigned by the operator; never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

/// Client-chosen identifier for a submission, used to deduplicate retries.
///
/// A leader that sees a request id it has already accepted returns the
/// original log index instead of appending the command a second time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u128);

impl RequestId {
    pub const fn get(self) -> u128 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{:x}", self.0)
    }
}

impl From<u128> for RequestId {
    fn from(value: u128) -> Self {
        RequestId(value)
    }
}

/// Sequence number for leader read-index rounds.
///
/// Issued per read on the leader, piggybacked on heartbeats, and echoed in
/// acknowledgments. Zero means "no read in flight". The counter belongs to
/// one leadership stint; pending sequences die with the leader state that
/// issued them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadSeq(u64);

impl ReadSeq {
    pub const NONE: Self = Self(0);

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> ReadSeq {
        ReadSeq(self.0.saturating_add(1))
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ReadSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

impl From<u64> for ReadSeq {
    fn from(value: u64) -> Self {
        ReadSeq(value)
    }
}
