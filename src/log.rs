//! The replicated log: entries, payloads, and the in-memory suffix kept
//! after compaction.

use serde::{Deserialize, Serialize};

use crate::membership::Membership;
use crate::types::{LogIndex, RequestId, Term};

/// What a log entry carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload<C> {
    /// A client command for the applied state machine.
    Command(C),
    /// A membership change; adopted by every node the moment the entry is
    /// appended, not when it commits.
    Config(Membership),
    /// Appended by each fresh leader so entries from earlier terms commit
    /// indirectly under the current-term restriction.
    Noop,
}

/// A single entry in the replicated log.
///
/// Entries are created once by a leader and copied on replication; the only
/// mutation a log ever performs is truncating a divergent suffix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<C> {
    pub term: Term,
    pub index: LogIndex,
    pub request_id: Option<RequestId>,
    pub payload: Payload<C>,
}

/// A point-in-time image of everything at or below `last_index`.
///
/// Carries the membership in force at the boundary so a follower restored
/// from the snapshot knows its configuration, plus the opaque state machine
/// bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: LogIndex,
    pub last_term: Term,
    pub membership: Membership,
    pub data: Vec<u8>,
}

/// The in-memory log: a compaction boundary plus the retained suffix.
///
/// `entries[i]` always sits at index `snapshot_index + i + 1`; appends keep
/// that continuity and truncation never reaches below the boundary, because
/// everything at or below it is committed.
#[derive(Clone, Debug)]
pub struct RaftLog<C> {
    snapshot: Option<Snapshot>,
    entries: Vec<LogEntry<C>>,
}

impl<C> RaftLog<C> {
    pub fn new() -> Self {
        Self {
            snapshot: None,
            entries: Vec::new(),
        }
    }

    /// Rebuild from persisted state.
    pub fn restore(snapshot: Option<Snapshot>, entries: Vec<LogEntry<C>>) -> Self {
        Self { snapshot, entries }
    }

    /// Index of the newest compacted entry; zero when nothing was compacted.
    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot.as_ref().map_or(LogIndex::ZERO, |s| s.last_index)
    }

    /// Term of the newest compacted entry; zero when nothing was compacted.
    pub fn snapshot_term(&self) -> Term {
        self.snapshot.as_ref().map_or(Term::ZERO, |s| s.last_term)
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map_or(self.snapshot_index(), |e| e.index)
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(self.snapshot_term(), |e| e.term)
    }

    /// Number of retained (non-compacted) entries.
    pub fn retained_len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[LogEntry<C>] {
        &self.entries
    }

    /// Position of `index` within the retained suffix.
    fn slot(&self, index: LogIndex) -> Option<usize> {
        if index <= self.snapshot_index() || index > self.last_index() {
            return None;
        }
        Some((index.get() - self.snapshot_index().get() - 1) as usize)
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry<C>> {
        self.slot(index).map(|i| &self.entries[i])
    }

    /// Term at `index`. The boundary itself answers with the snapshot term;
    /// anything below it is compacted away and unknowable.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index() {
            return Some(self.snapshot_term());
        }
        self.entry(index).map(|e| e.term)
    }

    /// The consistency check: does our log hold `prev_term` at `prev_index`?
    pub fn matches(&self, prev_index: LogIndex, prev_term: Term) -> bool {
        self.term_at(prev_index) == Some(prev_term)
    }

    /// All retained entries at or after `start`.
    pub fn entries_from(&self, start: LogIndex) -> &[LogEntry<C>] {
        match self.slot(start) {
            Some(i) => &self.entries[i..],
            None if start <= self.snapshot_index() => &self.entries,
            None => &[],
        }
    }

    /// Append one entry. The caller numbers entries contiguously.
    pub fn append(&mut self, entry: LogEntry<C>) {
        debug_assert_eq!(entry.index, self.last_index().next());
        self.entries.push(entry);
    }

    /// Drop every entry at or after `index`. Never reaches below the
    /// compaction boundary.
    pub fn truncate_from(&mut self, index: LogIndex) {
        debug_assert!(index > self.snapshot_index());
        if let Some(i) = self.slot(index) {
            self.entries.truncate(i);
        }
    }

    /// First retained index carrying `term`, if any.
    pub fn first_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries.iter().find(|e| e.term == term).map(|e| e.index)
    }

    /// Last retained index carrying `term`, if any.
    pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Newest membership entry in the retained suffix at or below `upto`.
    pub fn latest_config_at_or_below(&self, upto: LogIndex) -> Option<(LogIndex, &Membership)> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.index <= upto)
            .find_map(|e| match &e.payload {
                Payload::Config(m) => Some((e.index, m)),
                _ => None,
            })
    }

    /// Newest membership entry anywhere in the retained suffix.
    pub fn latest_config(&self) -> Option<(LogIndex, &Membership)> {
        self.latest_config_at_or_below(self.last_index())
    }

    /// Install a snapshot, keeping any retained suffix that extends past it.
    ///
    /// If we hold the entry at the snapshot's boundary with a matching term,
    /// the entries after it are still valid and survive; otherwise the whole
    /// retained log is replaced.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) {
        if self.term_at(snapshot.last_index) == Some(snapshot.last_term) {
            let keep_from = snapshot.last_index.next();
            self.entries = match self.slot(keep_from) {
                Some(i) => self.entries.split_off(i),
                None => Vec::new(),
            };
        } else {
            self.entries.clear();
        }
        self.snapshot = Some(snapshot);
    }
}

impl<C> Default for RaftLog<C> {
    fn default() -> Self {
        Self::new()
    }
}
