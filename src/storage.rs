//! The stable store seam.
//!
//! Term, vote, and log entries must survive a process restart, and must be
//! durable *before* any reply that promises them leaves the node. Replying
//! first and persisting later is how committed entries get lost. The runtime
//! enforces the ordering; implementations enforce the durability.

use serde::{Deserialize, Serialize};

use crate::log::{LogEntry, Snapshot};
use crate::types::{LogIndex, NodeId, Term};

/// The persisted term/vote pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// Everything a node reloads after a restart.
#[derive(Debug)]
pub struct PersistedState<C> {
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
    /// Entries after the snapshot boundary, in index order.
    pub entries: Vec<LogEntry<C>>,
}

impl<C> Default for PersistedState<C> {
    fn default() -> Self {
        Self {
            hard_state: HardState::default(),
            snapshot: None,
            entries: Vec::new(),
        }
    }
}

/// Durable storage for one node's consensus state.
///
/// Every mutating method must flush to durable media before returning.
/// A storage error is fatal for the node: the runtime halts it rather than
/// let it acknowledge state it might not hold after a crash.
pub trait Storage<C> {
    type Error: std::error::Error;

    /// Persist the term/vote pair, overwriting the previous one.
    fn save_hard_state(&mut self, hard_state: HardState) -> Result<(), Self::Error>;

    /// Persist entries appended at the end of the log.
    fn append_entries(&mut self, entries: &[LogEntry<C>]) -> Result<(), Self::Error>;

    /// Persist the removal of every entry at or after `from`.
    fn truncate_from(&mut self, from: LogIndex) -> Result<(), Self::Error>;

    /// Persist `snapshot` and drop every entry at or below its boundary.
    fn compact_through(&mut self, snapshot: &Snapshot) -> Result<(), Self::Error>;

    /// Load the full persisted state. Called once at startup.
    fn load(&self) -> Result<PersistedState<C>, Self::Error>;
}

/// In-memory storage: durable only for the lifetime of the value. Used by
/// the deterministic cluster harness, where "stable" means "survives a
/// simulated crash/restart of the node that owns it".
#[derive(Debug)]
pub struct MemoryStorage<C> {
    hard_state: HardState,
    snapshot: Option<Snapshot>,
    entries: Vec<LogEntry<C>>,
}

impl<C> MemoryStorage<C> {
    pub fn new() -> Self {
        Self {
            hard_state: HardState::default(),
            snapshot: None,
            entries: Vec::new(),
        }
    }

    /// Number of retained entries, for tests.
    pub fn retained_len(&self) -> usize {
        self.entries.len()
    }
}

impl<C> Default for MemoryStorage<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clone> Storage<C> for MemoryStorage<C> {
    type Error = std::convert::Infallible;

    fn save_hard_state(&mut self, hard_state: HardState) -> Result<(), Self::Error> {
        self.hard_state = hard_state;
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry<C>]) -> Result<(), Self::Error> {
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&mut self, from: LogIndex) -> Result<(), Self::Error> {
        self.entries.retain(|e| e.index < from);
        Ok(())
    }

    fn compact_through(&mut self, snapshot: &Snapshot) -> Result<(), Self::Error> {
        self.entries.retain(|e| e.index > snapshot.last_index);
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<PersistedState<C>, Self::Error> {
        Ok(PersistedState {
            hard_state: self.hard_state,
            snapshot: self.snapshot.clone(),
            entries: self.entries.clone(),
        })
    }
}
