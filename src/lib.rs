//! A replicated-consensus core with tunable quorums.
//!
//! Term-based leader election and leader-driven log replication in the
//! style of:
//! - "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout)
//! - Diego Ongaro's PhD dissertation
//!
//! On top of the classic protocol this crate adds a configurable write/read
//! quorum policy (elections always take a strict majority), single-step
//! joint-consensus voter changes, snapshot installation for lagging
//! followers, and quorum-checked linearizable reads that bypass the log.
//!
//! The consensus state machine in [`node`] is pure: it consumes messages and
//! timer events and emits [`action::Action`]s, and the caller performs the
//! I/O. [`runtime`] pairs a node with real storage and timers, [`server`]
//! runs that over TCP, and [`cluster`] drives whole clusters
//! deterministically for tests.

pub mod action;
pub mod cluster;
pub mod file_storage;
pub mod kv;
pub mod log;
pub mod membership;
pub mod message;
pub mod node;
pub mod quorum;
pub mod runtime;
pub mod server;
pub mod state;
pub mod storage;
pub mod term;
pub mod transport;
pub mod types;

pub use action::Action;
pub use log::{LogEntry, Payload, RaftLog, Snapshot};
pub use membership::Membership;
pub use message::Message;
pub use node::{ApplyItem, Node, ProposeError, Role};
pub use quorum::{QuorumPolicy, QuorumSize};
pub use runtime::{Event, Output, Runtime, StateMachine, TimerConfig};
pub use storage::{HardState, MemoryStorage, PersistedState, Storage};
pub use types::{LogIndex, NodeId, ReadSeq, RequestId, Term};
