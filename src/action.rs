//! Deferred effects emitted by the node core.
//!
//! The node never touches storage, sockets, or clocks. Every event handler
//! returns an ordered list of actions, and the runtime executes them in
//! order. That ordering carries the durability rule: a node always places
//! its persistence actions ahead of the sends that promise them.

use crate::log::{LogEntry, Snapshot};
use crate::message::Message;
use crate::storage::HardState;
use crate::types::{LogIndex, NodeId};

/// One deferred effect.
#[derive(Clone, Debug, PartialEq)]
pub enum Action<C> {
    /// Persist the term/vote pair. Must reach stable storage before any
    /// later `Send` in the same batch.
    SaveHardState(HardState),
    /// Persist freshly appended log entries.
    AppendLogEntries(Vec<LogEntry<C>>),
    /// Persist the removal of every entry at or after `from`.
    TruncateLog { from: LogIndex },
    /// Persist a snapshot and drop the log prefix it covers.
    CompactLog(Snapshot),
    /// Hand a message to the transport.
    Send { to: NodeId, message: Message<C> },
    /// Re-arm the randomized election timer.
    ResetElectionTimer,
    /// Re-arm the fixed-interval heartbeat timer.
    ResetHeartbeatTimer,
}
