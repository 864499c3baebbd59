//! A deterministic in-process cluster for tests.
//!
//! Nodes run on [`MemoryStorage`] and exchange messages through an explicit
//! in-flight queue: nothing moves until the test delivers it, so every
//! schedule is reproducible. Partitions block delivery, crashes park a
//! node's storage until it restarts with the same files, and the queue can
//! be duplicated wholesale to simulate a network that re-sends.
//!
//! Two safety invariants are checked after every delivery: at most one
//! leader per term, and no committed entry ever changes. Log matching is
//! exposed as an explicit assertion for tests to call at checkpoints.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::log::LogEntry;
use crate::membership::Membership;
use crate::message::Message;
use crate::node::{Node, ProposeError, Role};
use crate::quorum::QuorumPolicy;
use crate::runtime::{Event, Output, Runtime, StartError, StateMachine, TimerConfig};
use crate::storage::MemoryStorage;
use crate::types::{LogIndex, NodeId, ReadSeq, RequestId, Term};

use crate::action::Action;

/// A message on the simulated wire.
struct InFlight<C> {
    from: NodeId,
    to: NodeId,
    message: Message<C>,
}

pub struct Cluster<C, S: StateMachine<C>> {
    runtimes: BTreeMap<NodeId, Runtime<C, S, MemoryStorage<C>>>,
    /// Storage of crashed nodes, waiting for restart.
    parked: BTreeMap<NodeId, MemoryStorage<C>>,
    in_flight: VecDeque<InFlight<C>>,
    /// Partition groups; empty means fully connected.
    groups: HashMap<NodeId, usize>,
    bootstrap: Membership,
    quorum: QuorumPolicy,
    /// Election safety ledger: the one leader seen for each term.
    leaders_by_term: HashMap<Term, NodeId>,
    /// Commit safety ledger: every entry ever observed as committed.
    committed: BTreeMap<LogIndex, LogEntry<C>>,
}

impl<C, S> Cluster<C, S>
where
    C: Clone + PartialEq + std::fmt::Debug,
    S: StateMachine<C> + Default,
{
    /// A fully connected cluster of `size` nodes with ids 1..=size and
    /// majority quorums.
    pub fn new(size: usize) -> Self {
        Self::with_policy(size, QuorumPolicy::default())
    }

    pub fn with_policy(size: usize, quorum: QuorumPolicy) -> Self {
        let ids: BTreeSet<NodeId> = (1..=size).map(|i| NodeId::from(i as u64)).collect();
        let bootstrap = Membership::new(ids.clone());
        let runtimes = ids
            .iter()
            .map(|&id| {
                let node = Node::new(id, bootstrap.clone(), quorum);
                (
                    id,
                    Runtime::new(node, S::default(), MemoryStorage::new(), TimerConfig::default()),
                )
            })
            .collect();
        Self {
            runtimes,
            parked: BTreeMap::new(),
            in_flight: VecDeque::new(),
            groups: HashMap::new(),
            bootstrap,
            quorum,
            leaders_by_term: HashMap::new(),
            committed: BTreeMap::new(),
        }
    }

    /// Spin up an empty node, e.g. the target of a membership change. It
    /// syncs from the leader once a configuration includes it.
    pub fn add_node(&mut self, id: NodeId) {
        let node = Node::new(id, self.bootstrap.clone(), self.quorum);
        self.runtimes.insert(
            id,
            Runtime::new(node, S::default(), MemoryStorage::new(), TimerConfig::default()),
        );
    }

    pub fn node(&self, id: NodeId) -> &Node<C> {
        self.runtimes[&id].node()
    }

    pub fn state_machine(&self, id: NodeId) -> &S {
        self.runtimes[&id].state_machine()
    }

    pub fn is_up(&self, id: NodeId) -> bool {
        self.runtimes.contains_key(&id)
    }

    /// The current leader among live nodes, if any. With a stale leader
    /// still running in a minority partition there can briefly be two; use
    /// [`Cluster::leaders`] in scripts that create that situation.
    pub fn leader(&self) -> Option<NodeId> {
        self.leaders().into_iter().next()
    }

    pub fn leaders(&self) -> Vec<NodeId> {
        self.runtimes
            .values()
            .filter(|rt| rt.node().is_leader())
            .map(|rt| rt.node().id())
            .collect()
    }

    /// (followers, candidates, leaders) among live nodes.
    pub fn role_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for rt in self.runtimes.values() {
            match rt.node().role() {
                Role::Follower(_) => counts.0 += 1,
                Role::Candidate(_) => counts.1 += 1,
                Role::Leader(_) => counts.2 += 1,
            }
        }
        counts
    }

    // ---- driving events ----

    pub fn election_timeout(&mut self, id: NodeId) {
        if let Some(rt) = self.runtimes.get_mut(&id) {
            let sends = rt.handle(Event::ElectionTimeout);
            self.queue_sends(id, sends);
        }
    }

    pub fn heartbeat_timeout(&mut self, id: NodeId) {
        if let Some(rt) = self.runtimes.get_mut(&id) {
            let sends = rt.handle(Event::HeartbeatTimeout);
            self.queue_sends(id, sends);
        }
    }

    /// Time out `id` and deliver everything; panics unless it won.
    pub fn elect(&mut self, id: NodeId) {
        self.election_timeout(id);
        self.deliver_all();
        assert!(
            self.node(id).is_leader(),
            "election did not produce the expected leader"
        );
    }

    pub fn submit(
        &mut self,
        id: NodeId,
        command: C,
        request_id: Option<RequestId>,
    ) -> Result<LogIndex, ProposeError> {
        let rt = self.runtimes.get_mut(&id).ok_or(ProposeError::Halted)?;
        let (index, sends) = rt.submit(command, request_id)?;
        self.queue_sends(id, sends);
        Ok(index)
    }

    pub fn submit_query(&mut self, id: NodeId, query: C) -> Result<ReadSeq, ProposeError> {
        let rt = self.runtimes.get_mut(&id).ok_or(ProposeError::Halted)?;
        let (seq, sends) = rt.submit_query(query)?;
        self.queue_sends(id, sends);
        Ok(seq)
    }

    pub fn change_membership(
        &mut self,
        id: NodeId,
        new_voters: BTreeSet<NodeId>,
    ) -> Result<LogIndex, ProposeError> {
        let rt = self.runtimes.get_mut(&id).ok_or(ProposeError::Halted)?;
        let (index, sends) = rt.change_membership(new_voters)?;
        self.queue_sends(id, sends);
        Ok(index)
    }

    pub fn compact(&mut self, id: NodeId) -> bool {
        self.runtimes
            .get_mut(&id)
            .map(|rt| rt.compact())
            .unwrap_or(false)
    }

    /// Drain the outputs a node produced by applying committed work.
    pub fn outputs(&mut self, id: NodeId) -> Vec<Output<S::Output>> {
        self.runtimes
            .get_mut(&id)
            .map(|rt| rt.take_outputs())
            .unwrap_or_default()
    }

    // ---- the wire ----

    /// Deliver queued messages until the cluster goes quiet.
    pub fn deliver_all(&mut self) {
        while self.deliver_one() {}
    }

    /// Deliver the oldest in-flight message. Messages to crashed or
    /// partitioned-away nodes are dropped, like a network would drop them.
    /// Returns false when the queue is empty.
    pub fn deliver_one(&mut self) -> bool {
        let Some(inflight) = self.in_flight.pop_front() else {
            return false;
        };
        if !self.connected(inflight.from, inflight.to) {
            return true;
        }
        if let Some(rt) = self.runtimes.get_mut(&inflight.to) {
            let sends = rt.handle(Event::Message {
                from: inflight.from,
                message: inflight.message,
            });
            self.queue_sends(inflight.to, sends);
            self.check_safety();
        }
        true
    }

    /// Re-queue a copy of everything currently in flight, simulating a
    /// network that delivers every message twice.
    pub fn duplicate_in_flight(&mut self) {
        let copies: Vec<InFlight<C>> = self
            .in_flight
            .iter()
            .map(|m| InFlight {
                from: m.from,
                to: m.to,
                message: m.message.clone(),
            })
            .collect();
        self.in_flight.extend(copies);
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Split the cluster into isolated groups. Nodes not named end up in
    /// singleton groups and can talk to nobody.
    pub fn partition(&mut self, groups: &[&[u64]]) {
        self.groups.clear();
        for (pos, group) in groups.iter().enumerate() {
            for &member in *group {
                self.groups.insert(NodeId::from(member), pos);
            }
        }
        let mut next = groups.len();
        let all: Vec<NodeId> = self
            .runtimes
            .keys()
            .chain(self.parked.keys())
            .copied()
            .collect();
        for id in all {
            if !self.groups.contains_key(&id) {
                self.groups.insert(id, next);
                next += 1;
            }
        }
    }

    pub fn heal(&mut self) {
        self.groups.clear();
    }

    fn connected(&self, a: NodeId, b: NodeId) -> bool {
        if self.groups.is_empty() {
            return true;
        }
        self.groups.get(&a) == self.groups.get(&b)
    }

    // ---- crash and restart ----

    /// Take the node down, keeping its stable storage for a later restart.
    /// Messages already in flight stay on the wire; deliveries to the dead
    /// node are dropped.
    pub fn crash(&mut self, id: NodeId) {
        if let Some(rt) = self.runtimes.remove(&id) {
            let (_, _, storage) = rt.into_parts();
            self.parked.insert(id, storage);
        }
    }

    /// Bring a crashed node back from its own stable storage.
    pub fn restart(&mut self, id: NodeId) -> Result<(), StartError<std::convert::Infallible>> {
        let Some(storage) = self.parked.remove(&id) else {
            return Ok(());
        };
        let rt = Runtime::from_storage(
            id,
            self.bootstrap.clone(),
            self.quorum,
            S::default(),
            storage,
            TimerConfig::default(),
        )?;
        self.runtimes.insert(id, rt);
        Ok(())
    }

    fn queue_sends(&mut self, from: NodeId, sends: Vec<Action<C>>) {
        for action in sends {
            if let Action::Send { to, message } = action {
                self.in_flight.push_back(InFlight { from, to, message });
            }
        }
    }

    // ---- safety invariants ----

    /// Election safety and commit stability, checked after each delivery.
    fn check_safety(&mut self) {
        for rt in self.runtimes.values() {
            let node = rt.node();
            if node.is_leader() {
                let id = node.id();
                let recorded = self.leaders_by_term.entry(node.current_term()).or_insert(id);
                assert_eq!(
                    *recorded, id,
                    "two leaders elected in term {}",
                    node.current_term()
                );
            }
            let log = node.log();
            let mut index = log.snapshot_index().next();
            while index <= node.commit_index() {
                if let Some(entry) = log.entry(index) {
                    match self.committed.get(&index) {
                        Some(seen) => assert_eq!(
                            seen, entry,
                            "committed entry at {index} changed after the fact"
                        ),
                        None => {
                            self.committed.insert(index, entry.clone());
                        }
                    }
                }
                index = index.next();
            }
        }
    }

    /// Pairwise log matching: wherever two live logs hold the same term at
    /// the same index, the entries and all earlier shared entries agree.
    pub fn assert_log_matching(&self) {
        let nodes: Vec<&Node<C>> = self.runtimes.values().map(|rt| rt.node()).collect();
        for (pos, a) in nodes.iter().enumerate() {
            for b in nodes.iter().skip(pos + 1) {
                let start = a.log().snapshot_index().max(b.log().snapshot_index()).next();
                let end = a.log().last_index().min(b.log().last_index());
                let mut index = end;
                // Find the highest shared index with matching terms, then
                // require equality from there down.
                while index >= start && index > LogIndex::ZERO {
                    if a.log().term_at(index) == b.log().term_at(index) {
                        break;
                    }
                    match index.prev() {
                        Some(prev) => index = prev,
                        None => break,
                    }
                }
                let mut check = start;
                while check <= index {
                    assert_eq!(
                        a.log().entry(check),
                        b.log().entry(check),
                        "log matching violated between {} and {} at {check}",
                        a.id(),
                        b.id()
                    );
                    check = check.next();
                }
            }
        }
    }
}
