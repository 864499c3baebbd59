//! Glue between the pure consensus node and the world: timers, durable
//! storage, and the applied state machine.
//!
//! The runtime executes every persistence action *before* handing back the
//! sends that depend on it, so a reply never leaves the node ahead of the
//! state that justifies it. A storage failure flips the runtime into a
//! sticky halted state: the node keeps its memory but stops participating,
//! which is strictly safer than carrying on with durability promises it
//! cannot keep.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::action::Action;
use crate::log::Payload;
use crate::membership::Membership;
use crate::message::Message;
use crate::node::{ApplyItem, Node, ProposeError};
use crate::quorum::QuorumPolicy;
use crate::storage::Storage;
use crate::types::{LogIndex, NodeId, ReadSeq, RequestId};

/// The applied state machine: commands in, outputs and snapshots out.
pub trait StateMachine<C> {
    type Output;

    /// Apply a committed command, mutating state.
    fn apply(&mut self, command: C) -> Self::Output;

    /// Answer a read-only query against current state.
    fn query(&self, query: C) -> Self::Output;

    /// Serialize the full state for a snapshot.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the full state with a snapshot image.
    fn restore(&mut self, data: &[u8]) -> Result<(), RestoreError>;
}

/// A snapshot image the state machine refused to load.
#[derive(Debug, thiserror::Error)]
#[error("state machine snapshot rejected: {0}")]
pub struct RestoreError(pub String);

/// Inputs that drive the runtime.
#[derive(Debug)]
pub enum Event<C> {
    ElectionTimeout,
    HeartbeatTimeout,
    Message { from: NodeId, message: Message<C> },
}

/// Timer configuration.
///
/// The effective election timeout is randomized per arming into
/// [timeout, 2 * timeout) so competing candidates fall out of step.
#[derive(Clone, Copy, Debug)]
pub struct TimerConfig {
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(100),
        }
    }
}

impl TimerConfig {
    /// Heartbeats must fit inside the election timeout or followers will
    /// campaign against a healthy leader.
    pub fn validate(&self) -> Result<(), InvalidTimerConfig> {
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.election_timeout {
            return Err(InvalidTimerConfig {
                election: self.election_timeout,
                heartbeat: self.heartbeat_interval,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("heartbeat interval {heartbeat:?} must be non-zero and shorter than election timeout {election:?}")]
pub struct InvalidTimerConfig {
    pub election: Duration,
    pub heartbeat: Duration,
}

/// What the cluster owes its clients after applying committed work.
#[derive(Debug, PartialEq)]
pub enum Output<O> {
    /// A committed command was applied at `index`.
    Applied { index: LogIndex, output: O },
    /// A configuration entry committed at `index`.
    ConfigCommitted { index: LogIndex },
    /// A strong read completed its quorum round and was evaluated.
    ReadServed { seq: ReadSeq, output: O },
}

/// Why a runtime could not be brought up from storage.
#[derive(Debug, thiserror::Error)]
pub enum StartError<E: std::error::Error> {
    #[error("storage failed during startup: {0}")]
    Storage(#[source] E),
    #[error(transparent)]
    Restore(#[from] RestoreError),
}

/// One node's event loop state: the consensus core plus its timers,
/// storage, and state machine.
pub struct Runtime<C, S: StateMachine<C>, St> {
    node: Node<C>,
    state_machine: S,
    storage: St,
    config: TimerConfig,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    outputs: Vec<Output<S::Output>>,
    halted: Option<String>,
}

impl<C, S, St> Runtime<C, S, St>
where
    C: Clone,
    S: StateMachine<C>,
    St: Storage<C>,
{
    pub fn new(node: Node<C>, state_machine: S, storage: St, config: TimerConfig) -> Self {
        Self {
            node,
            state_machine,
            storage,
            election_deadline: Self::randomized_election_deadline(&config),
            heartbeat_deadline: Instant::now() + config.heartbeat_interval,
            config,
            outputs: Vec::new(),
            halted: None,
        }
    }

    /// Bring a node up from its stable store. The state machine is rebuilt
    /// from the persisted snapshot before any new entry applies.
    pub fn from_storage(
        id: NodeId,
        bootstrap: Membership,
        quorum: QuorumPolicy,
        mut state_machine: S,
        storage: St,
        config: TimerConfig,
    ) -> Result<Self, StartError<St::Error>> {
        let persisted = storage.load().map_err(StartError::Storage)?;
        if let Some(snapshot) = &persisted.snapshot {
            state_machine.restore(&snapshot.data)?;
        }
        let node = Node::restore(id, bootstrap, quorum, persisted);
        tracing::info!(
            node = %node.id(),
            term = %node.current_term(),
            last_index = %node.log().last_index(),
            "node started"
        );
        Ok(Self::new(node, state_machine, storage, config))
    }

    pub fn node(&self) -> &Node<C> {
        &self.node
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    pub fn storage(&self) -> &St {
        &self.storage
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halted_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Tear the runtime apart, e.g. to hand the storage to a restarted
    /// instance.
    pub fn into_parts(self) -> (Node<C>, S, St) {
        (self.node, self.state_machine, self.storage)
    }

    /// Feed one event through the node. Returns the sends the caller must
    /// deliver; persistence and timer actions are executed in place, in
    /// order, before any send is handed out. A halted runtime swallows
    /// events.
    pub fn handle(&mut self, event: Event<C>) -> Vec<Action<C>> {
        if self.halted.is_some() {
            return Vec::new();
        }
        let actions = match event {
            Event::ElectionTimeout => self.node.election_timeout(),
            Event::HeartbeatTimeout => self.node.heartbeat_timeout(),
            Event::Message { from, message } => self.dispatch(from, message),
        };
        let sends = self.process_actions(actions);
        self.apply_committed();
        if self.halted.is_some() {
            return Vec::new();
        }
        sends
    }

    fn dispatch(&mut self, from: NodeId, message: Message<C>) -> Vec<Action<C>> {
        match message {
            Message::RequestVote(request) => self.node.handle_request_vote(from, request),
            Message::RequestVoteResponse(response) => {
                self.node.handle_request_vote_response(from, response)
            }
            Message::AppendEntries(request) => self.node.handle_append_entries(from, request),
            Message::AppendEntriesResponse(response) => {
                self.node.handle_append_entries_response(from, response)
            }
            Message::InstallSnapshot(request) => self.node.handle_install_snapshot(from, request),
            Message::InstallSnapshotResponse(response) => {
                self.node.handle_install_snapshot_response(from, response)
            }
        }
    }

    /// Which timer, if any, has expired. Leaders run on the heartbeat
    /// timer; everyone else runs on the election timer.
    pub fn poll_timers(&self) -> Option<Event<C>> {
        if self.halted.is_some() {
            return None;
        }
        let now = Instant::now();
        if self.node.is_leader() {
            (now >= self.heartbeat_deadline).then_some(Event::HeartbeatTimeout)
        } else {
            (now >= self.election_deadline).then_some(Event::ElectionTimeout)
        }
    }

    /// When the next timer fires, for event loops that want to sleep.
    pub fn next_deadline(&self) -> Instant {
        if self.node.is_leader() {
            self.heartbeat_deadline
        } else {
            self.election_deadline
        }
    }

    /// Propose a command; see [`Node::submit`].
    pub fn submit(
        &mut self,
        command: C,
        request_id: Option<RequestId>,
    ) -> Result<(LogIndex, Vec<Action<C>>), ProposeError> {
        if self.halted.is_some() {
            return Err(ProposeError::Halted);
        }
        let (index, actions) = self.node.submit(command, request_id)?;
        let sends = self.process_actions(actions);
        self.apply_committed();
        if self.halted.is_some() {
            return Err(ProposeError::Halted);
        }
        Ok((index, sends))
    }

    /// Register a strong read; see [`Node::submit_query`].
    pub fn submit_query(&mut self, query: C) -> Result<(ReadSeq, Vec<Action<C>>), ProposeError> {
        if self.halted.is_some() {
            return Err(ProposeError::Halted);
        }
        let (seq, actions) = self.node.submit_query(query)?;
        let sends = self.process_actions(actions);
        self.apply_committed();
        if self.halted.is_some() {
            return Err(ProposeError::Halted);
        }
        Ok((seq, sends))
    }

    /// Start switching to a new voter set; see [`Node::change_membership`].
    pub fn change_membership(
        &mut self,
        new_voters: std::collections::BTreeSet<NodeId>,
    ) -> Result<(LogIndex, Vec<Action<C>>), ProposeError> {
        if self.halted.is_some() {
            return Err(ProposeError::Halted);
        }
        let (index, actions) = self.node.change_membership(new_voters)?;
        let sends = self.process_actions(actions);
        self.apply_committed();
        if self.halted.is_some() {
            return Err(ProposeError::Halted);
        }
        Ok((index, sends))
    }

    /// Snapshot the state machine at its applied index and compact the log
    /// behind it. Returns whether a snapshot was taken.
    pub fn compact(&mut self) -> bool {
        if self.halted.is_some() {
            return false;
        }
        let through = self.node.last_applied();
        let data = self.state_machine.snapshot();
        let actions = self.node.compact(through, data);
        let compacted = !actions.is_empty();
        self.process_actions(actions);
        compacted && self.halted.is_none()
    }

    /// Drain the outputs accumulated by applying committed work.
    pub fn take_outputs(&mut self) -> Vec<Output<S::Output>> {
        std::mem::take(&mut self.outputs)
    }

    fn process_actions(&mut self, actions: Vec<Action<C>>) -> Vec<Action<C>> {
        let mut sends = Vec::new();
        for action in actions {
            match action {
                Action::SaveHardState(hard_state) => {
                    if let Err(err) = self.storage.save_hard_state(hard_state) {
                        return self.halt_on(err);
                    }
                }
                Action::AppendLogEntries(entries) => {
                    if let Err(err) = self.storage.append_entries(&entries) {
                        return self.halt_on(err);
                    }
                }
                Action::TruncateLog { from } => {
                    if let Err(err) = self.storage.truncate_from(from) {
                        return self.halt_on(err);
                    }
                }
                Action::CompactLog(snapshot) => {
                    if let Err(err) = self.storage.compact_through(&snapshot) {
                        return self.halt_on(err);
                    }
                }
                Action::ResetElectionTimer => {
                    self.election_deadline = Self::randomized_election_deadline(&self.config);
                }
                Action::ResetHeartbeatTimer => {
                    self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval;
                }
                send @ Action::Send { .. } => sends.push(send),
            }
        }
        sends
    }

    /// Stop participating. Unsent sends are dropped because the state
    /// backing them never became durable.
    fn halt_on(&mut self, err: St::Error) -> Vec<Action<C>> {
        tracing::error!(node = %self.node.id(), error = %err, "storage failure, halting node");
        self.halted = Some(err.to_string());
        Vec::new()
    }

    fn apply_committed(&mut self) {
        if self.halted.is_some() {
            return;
        }
        while let Some(item) = self.node.take_apply_item() {
            match item {
                ApplyItem::Snapshot(snapshot) => {
                    if let Err(err) = self.state_machine.restore(&snapshot.data) {
                        tracing::error!(
                            node = %self.node.id(),
                            error = %err,
                            "snapshot restore failed, halting node"
                        );
                        self.halted = Some(err.to_string());
                        return;
                    }
                }
                ApplyItem::Entry(entry) => match entry.payload {
                    Payload::Command(command) => {
                        let output = self.state_machine.apply(command);
                        self.outputs.push(Output::Applied {
                            index: entry.index,
                            output,
                        });
                    }
                    Payload::Config(_) => {
                        self.outputs.push(Output::ConfigCommitted { index: entry.index });
                    }
                    Payload::Noop => {}
                },
            }
        }
        for (seq, query) in self.node.take_serveable_reads() {
            let output = self.state_machine.query(query);
            self.outputs.push(Output::ReadServed { seq, output });
        }
    }

    fn randomized_election_deadline(config: &TimerConfig) -> Instant {
        let base = config.election_timeout;
        let jitter = rand::rng().random_range(0..base.as_millis().max(1) as u64);
        Instant::now() + base + Duration::from_millis(jitter)
    }
}
