//! The consensus core: one node's view of the replicated log.
//!
//! `Node` is pure state. Every input (a timeout firing, a message arriving,
//! a client submission) is a method call that mutates the node and returns
//! the ordered [`Action`]s the caller must carry out. Persistence actions
//! always precede the sends they justify, so a runtime that executes the
//! list in order never acknowledges state it has not made durable.

use std::collections::BTreeSet;

use crate::action::Action;
use crate::log::{LogEntry, Payload, RaftLog, Snapshot};
use crate::membership::Membership;
use crate::message::{
    AppendEntries, AppendEntriesResponse, InstallSnapshot, InstallSnapshotResponse, Message,
    RequestVote, RequestVoteResponse,
};
use crate::quorum::QuorumPolicy;
use crate::state::{Candidate, Follower, Leader};
use crate::storage::{HardState, PersistedState};
use crate::term::{TermCheck, TermClock};
use crate::types::{LogIndex, NodeId, ReadSeq, RequestId, Term};

/// Role with its role-specific volatile state.
pub enum Role<C> {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader<C>),
}

/// One unit of work for the state machine, in apply order.
#[derive(Debug, PartialEq)]
pub enum ApplyItem<C> {
    /// Replace the state machine wholesale with a snapshot image.
    Snapshot(Snapshot),
    /// Apply the next committed entry.
    Entry(LogEntry<C>),
}

/// Why a client operation was refused without being proposed.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProposeError {
    /// Only the leader accepts proposals. The hint, when present, is the
    /// node the caller should retry against.
    #[error("not the leader")]
    NotLeader { hint: Option<NodeId> },
    /// A configuration change is still in flight; one at a time.
    #[error("configuration change already in progress")]
    ReconfigInProgress,
    /// The proposed voter set was empty.
    #[error("membership must contain at least one voter")]
    InvalidMembership,
    /// The node hit a storage failure and no longer participates.
    #[error("node is halted after a storage failure")]
    Halted,
}

/// A consensus participant.
///
/// The node never does I/O. Callers feed it timeouts and messages and are
/// handed back actions: what to persist, what to send, which timer to
/// re-arm. Committed entries are drained separately through
/// [`Node::take_apply_item`].
pub struct Node<C> {
    id: NodeId,
    term_clock: TermClock,
    log: RaftLog<C>,
    /// Effective configuration: the newest config entry in the log, adopted
    /// the moment it is appended, not when it commits.
    membership: Membership,
    /// Index of the entry `membership` came from; the snapshot boundary when
    /// it came from a snapshot, zero when it is the bootstrap set.
    config_index: LogIndex,
    /// Config to fall back to when truncation removes every config entry.
    fallback_membership: Membership,
    quorum: QuorumPolicy,
    commit_index: LogIndex,
    last_applied: LogIndex,
    /// Snapshot waiting to be handed to the state machine before any
    /// further entries.
    pending_restore: Option<Snapshot>,
    role: Role<C>,
}

impl<C: Clone> Node<C> {
    /// Fresh node with an empty log. `membership` is the bootstrap voter
    /// set, identical on every node of the new cluster.
    pub fn new(id: NodeId, membership: Membership, quorum: QuorumPolicy) -> Self {
        Self::restore(id, membership, quorum, PersistedState::default())
    }

    /// Rebuild a node from what storage handed back after a restart.
    ///
    /// The effective configuration is the newest config entry in the log,
    /// else the snapshot's, else `bootstrap`. Commit and apply cursors
    /// restart at the snapshot boundary; the leader's next round of
    /// AppendEntries re-advertises the true commit index.
    pub fn restore(
        id: NodeId,
        bootstrap: Membership,
        quorum: QuorumPolicy,
        persisted: PersistedState<C>,
    ) -> Self {
        let term_clock = TermClock::restore(persisted.hard_state.term, persisted.hard_state.voted_for);
        let log = RaftLog::restore(persisted.snapshot, persisted.entries);
        let fallback = log
            .snapshot()
            .map(|s| s.membership.clone())
            .unwrap_or(bootstrap);
        let boundary = log.snapshot_index();
        let (config_index, membership) = match log.latest_config() {
            Some((index, config)) => (index, config.clone()),
            None => (boundary, fallback.clone()),
        };
        Self {
            id,
            term_clock,
            log,
            membership,
            config_index,
            fallback_membership: fallback,
            quorum,
            commit_index: boundary,
            last_applied: boundary,
            pending_restore: None,
            role: Role::Follower(Follower::new(None)),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn current_term(&self) -> Term {
        self.term_clock.current()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn role(&self) -> &Role<C> {
        &self.role
    }

    /// Where to redirect clients: the known leader, ourselves when leading,
    /// nothing mid-election.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match &self.role {
            Role::Follower(follower) => follower.leader_id,
            Role::Candidate(_) => None,
            Role::Leader(_) => Some(self.id),
        }
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn log(&self) -> &RaftLog<C> {
        &self.log
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    // ---- timeouts ----

    /// The election timer fired without valid leader contact.
    pub fn election_timeout(&mut self) -> Vec<Action<C>> {
        if self.is_leader() {
            return Vec::new();
        }
        if !self.membership.is_voter(self.id) {
            // A node outside the voter set never campaigns; it would only
            // disturb the cluster it was removed from.
            return vec![Action::ResetElectionTimer];
        }
        self.start_election()
    }

    /// The heartbeat timer fired; leaders re-assert authority.
    pub fn heartbeat_timeout(&mut self) -> Vec<Action<C>> {
        if !self.is_leader() {
            return Vec::new();
        }
        let mut actions = self.broadcast_appends();
        actions.push(Action::ResetHeartbeatTimer);
        actions
    }

    fn start_election(&mut self) -> Vec<Action<C>> {
        let term = self.term_clock.begin_election(self.id);
        tracing::info!(node = %self.id, term = %term, "election timeout, starting election");
        self.role = Role::Candidate(Candidate::new(self.id));

        let request = RequestVote {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        let mut actions = vec![Action::SaveHardState(self.hard_state())];
        for peer in self.membership.peers(self.id) {
            actions.push(Action::Send {
                to: peer,
                message: Message::RequestVote(request.clone()),
            });
        }
        actions.push(Action::ResetElectionTimer);

        // A cluster of one wins with its own vote.
        let won = matches!(&self.role, Role::Candidate(candidate) if candidate.has_won(&self.membership));
        if won {
            actions.extend(self.become_leader());
        }
        actions
    }

    // ---- elections ----

    pub fn handle_request_vote(&mut self, from: NodeId, request: RequestVote) -> Vec<Action<C>> {
        let mut actions = Vec::new();
        match self.term_clock.observe(request.term) {
            TermCheck::Stale => {
                return vec![self.send_vote_response(from, false)];
            }
            TermCheck::Advanced => {
                let demoted = !matches!(self.role, Role::Follower(_));
                self.become_follower(None);
                actions.push(Action::SaveHardState(self.hard_state()));
                if demoted {
                    actions.push(Action::ResetElectionTimer);
                }
            }
            TermCheck::Current => {}
        }

        // Grant only to candidates whose log is at least as complete as
        // ours, compared by (last term, last index).
        let up_to_date = (request.last_log_term, request.last_log_index)
            >= (self.log.last_term(), self.log.last_index());
        let granted = up_to_date && self.term_clock.record_vote(request.candidate_id);
        if granted {
            tracing::debug!(
                node = %self.id,
                term = %self.term_clock.current(),
                candidate = %request.candidate_id,
                "vote granted"
            );
            actions.push(Action::SaveHardState(self.hard_state()));
            actions.push(Action::ResetElectionTimer);
        }
        actions.push(self.send_vote_response(from, granted));
        actions
    }

    fn send_vote_response(&self, to: NodeId, vote_granted: bool) -> Action<C> {
        Action::Send {
            to,
            message: Message::RequestVoteResponse(RequestVoteResponse {
                term: self.term_clock.current(),
                vote_granted,
            }),
        }
    }

    pub fn handle_request_vote_response(
        &mut self,
        from: NodeId,
        response: RequestVoteResponse,
    ) -> Vec<Action<C>> {
        match self.term_clock.observe(response.term) {
            TermCheck::Stale => Vec::new(),
            TermCheck::Advanced => self.step_down(),
            TermCheck::Current => {
                let won = match &mut self.role {
                    Role::Candidate(candidate) if response.vote_granted => {
                        candidate.record_vote(from);
                        candidate.has_won(&self.membership)
                    }
                    _ => false,
                };
                if won {
                    self.become_leader()
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn become_leader(&mut self) -> Vec<Action<C>> {
        tracing::info!(
            node = %self.id,
            term = %self.term_clock.current(),
            last_index = %self.log.last_index(),
            "became leader"
        );
        let peers = self.membership.peers(self.id);
        self.role = Role::Leader(Leader::new(&peers, &self.log));

        // A no-op in the new term lets earlier-term entries commit under
        // the current-term rule and marks the read gate.
        let entry = LogEntry {
            term: self.term_clock.current(),
            index: self.log.last_index().next(),
            request_id: None,
            payload: Payload::Noop,
        };
        self.log.append(entry.clone());

        let mut actions = vec![Action::AppendLogEntries(vec![entry])];
        actions.extend(self.broadcast_appends());
        actions.push(Action::ResetHeartbeatTimer);
        actions.extend(self.try_advance_commit());
        actions
    }

    /// Adopt a higher term discovered through a response and fall back to
    /// follower.
    fn step_down(&mut self) -> Vec<Action<C>> {
        let demoted = !matches!(self.role, Role::Follower(_));
        self.become_follower(None);
        let mut actions = vec![Action::SaveHardState(self.hard_state())];
        if demoted {
            actions.push(Action::ResetElectionTimer);
        }
        actions
    }

    fn become_follower(&mut self, leader_id: Option<NodeId>) {
        if self.is_leader() {
            tracing::info!(node = %self.id, term = %self.term_clock.current(), "stepping down");
        }
        self.role = Role::Follower(Follower::new(leader_id));
    }

    // ---- replication, follower side ----

    pub fn handle_append_entries(&mut self, from: NodeId, request: AppendEntries<C>) -> Vec<Action<C>> {
        let mut actions = Vec::new();
        match self.term_clock.observe(request.term) {
            TermCheck::Stale => {
                return vec![self.send_append_response(from, false, LogIndex::ZERO, ReadSeq::NONE)];
            }
            TermCheck::Advanced => {
                self.become_follower(Some(request.leader_id));
                actions.push(Action::SaveHardState(self.hard_state()));
            }
            TermCheck::Current => match &self.role {
                Role::Leader(_) => {
                    tracing::warn!(
                        node = %self.id,
                        term = %self.term_clock.current(),
                        other = %request.leader_id,
                        "append entries from another leader in our own term, ignoring"
                    );
                    return Vec::new();
                }
                Role::Candidate(_) => self.become_follower(Some(request.leader_id)),
                Role::Follower(_) => {
                    if let Role::Follower(follower) = &mut self.role {
                        follower.leader_id = Some(request.leader_id);
                    }
                }
            },
        }
        actions.push(Action::ResetElectionTimer);

        // Everything at or below the snapshot boundary is committed, so a
        // prev inside the snapshot is treated as matching at the boundary.
        let boundary = self.log.snapshot_index();
        let (prev_index, prev_term, entries) = if request.prev_log_index < boundary {
            let entries: Vec<LogEntry<C>> = request
                .entries
                .into_iter()
                .filter(|e| e.index > boundary)
                .collect();
            (boundary, self.log.snapshot_term(), entries)
        } else {
            (request.prev_log_index, request.prev_log_term, request.entries)
        };

        if !self.log.matches(prev_index, prev_term) {
            let (conflict_index, conflict_term) = self.conflict_hint(prev_index);
            tracing::debug!(
                node = %self.id,
                prev = %prev_index,
                conflict = %conflict_index,
                "append entries consistency check failed"
            );
            actions.push(Action::Send {
                to: from,
                message: Message::AppendEntriesResponse(AppendEntriesResponse {
                    term: self.term_clock.current(),
                    success: false,
                    match_index: LogIndex::ZERO,
                    conflict_index,
                    conflict_term,
                    read_seq: ReadSeq::NONE,
                }),
            });
            return actions;
        }

        let match_index = entries.last().map(|e| e.index).unwrap_or(prev_index);

        // Skip entries we already hold; truncate at the first real conflict
        // and append everything from there.
        let mut to_append: Vec<LogEntry<C>> = Vec::new();
        let mut truncate_at: Option<LogIndex> = None;
        for entry in entries {
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    truncate_at = Some(entry.index);
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }
        if let Some(at) = truncate_at {
            tracing::debug!(node = %self.id, from = %at, "truncating conflicting suffix");
            self.log.truncate_from(at);
            actions.push(Action::TruncateLog { from: at });
        }
        if !to_append.is_empty() {
            for entry in &to_append {
                self.log.append(entry.clone());
            }
            actions.push(Action::AppendLogEntries(to_append));
        }
        if truncate_at.is_some() || matches!(actions.last(), Some(Action::AppendLogEntries(_))) {
            // Config entries take effect when appended and stop doing so
            // when truncated away.
            self.refresh_config_from_log();
        }

        let new_commit = request.leader_commit.min(match_index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
        }

        actions.push(self.send_append_response(from, true, match_index, request.read_seq));
        actions
    }

    fn send_append_response(
        &self,
        to: NodeId,
        success: bool,
        match_index: LogIndex,
        read_seq: ReadSeq,
    ) -> Action<C> {
        Action::Send {
            to,
            message: Message::AppendEntriesResponse(AppendEntriesResponse {
                term: self.term_clock.current(),
                success,
                match_index,
                conflict_index: LogIndex::ZERO,
                conflict_term: None,
                read_seq,
            }),
        }
    }

    /// Where the leader should retry after a consistency-check rejection.
    fn conflict_hint(&self, prev_index: LogIndex) -> (LogIndex, Option<Term>) {
        match self.log.term_at(prev_index) {
            // Our log is shorter than prev; retry from just past our end.
            None => (self.log.last_index().next(), None),
            // We hold a different term at prev; expose that whole term so
            // the leader can skip over it in one step.
            Some(term) => {
                let first = self.log.first_index_of_term(term).unwrap_or(prev_index);
                (first, Some(term))
            }
        }
    }

    /// Recompute the effective configuration after the log changed shape.
    fn refresh_config_from_log(&mut self) {
        let (config_index, membership) = match self.log.latest_config() {
            Some((index, config)) => (index, config.clone()),
            None => (self.log.snapshot_index(), self.fallback_membership.clone()),
        };
        if config_index != self.config_index || membership != self.membership {
            tracing::info!(node = %self.id, membership = %membership, "adopted configuration");
            self.membership = membership;
            self.config_index = config_index;
        }
    }

    // ---- replication, leader side ----

    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        response: AppendEntriesResponse,
    ) -> Vec<Action<C>> {
        match self.term_clock.observe(response.term) {
            TermCheck::Stale => Vec::new(),
            TermCheck::Advanced => self.step_down(),
            TermCheck::Current => {
                if !self.is_leader() {
                    return Vec::new();
                }
                if response.success {
                    if let Role::Leader(leader) = &mut self.role {
                        leader.record_success(from, response.match_index);
                        leader.record_read_ack(from, response.read_seq);
                    }
                    let mut actions = self.try_advance_commit();
                    if self.peer_lags(from) {
                        actions.extend(self.send_append_to(from));
                    }
                    actions
                } else {
                    let next = self.retreat_target(from, &response);
                    if let Role::Leader(leader) = &mut self.role {
                        leader.set_next(from, next);
                    }
                    self.send_append_to(from)
                }
            }
        }
    }

    pub fn handle_install_snapshot_response(
        &mut self,
        from: NodeId,
        response: InstallSnapshotResponse,
    ) -> Vec<Action<C>> {
        match self.term_clock.observe(response.term) {
            TermCheck::Stale => Vec::new(),
            TermCheck::Advanced => self.step_down(),
            TermCheck::Current => {
                if !self.is_leader() {
                    return Vec::new();
                }
                if let Role::Leader(leader) = &mut self.role {
                    leader.record_success(from, response.match_index);
                }
                let mut actions = self.try_advance_commit();
                if self.peer_lags(from) {
                    actions.extend(self.send_append_to(from));
                }
                actions
            }
        }
    }

    fn peer_lags(&self, peer: NodeId) -> bool {
        match &self.role {
            Role::Leader(leader) => leader
                .progress(peer)
                .map(|p| p.next <= self.log.last_index())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Pick the next index to retry for `from` using the follower's
    /// conflict hint, falling back to a single step when the hint would
    /// not move us.
    fn retreat_target(&self, from: NodeId, response: &AppendEntriesResponse) -> LogIndex {
        let current_next = match &self.role {
            Role::Leader(leader) => leader.progress(from).map(|p| p.next),
            _ => None,
        }
        .unwrap_or(self.log.last_index().next());

        let hinted = match response.conflict_term {
            // We also hold the conflicting term: retry just past our last
            // entry of it, which is the latest point the logs can agree.
            Some(term) => match self.log.last_index_of_term(term) {
                Some(index) => index.next(),
                None => response.conflict_index,
            },
            None => response.conflict_index,
        };

        let mut next = hinted;
        if next >= current_next {
            next = current_next.prev().unwrap_or(LogIndex::ZERO);
        }
        next.max(LogIndex::from(1))
    }

    /// Build the replication message for one peer. Followers whose next
    /// entry was compacted away get the snapshot instead.
    fn build_append_for(&self, peer: NodeId) -> Option<Message<C>> {
        let Role::Leader(leader) = &self.role else {
            return None;
        };
        let next = leader
            .progress(peer)
            .map(|p| p.next)
            .unwrap_or(self.log.last_index().next());

        if next <= self.log.snapshot_index() {
            let snapshot = self.log.snapshot()?;
            return Some(Message::InstallSnapshot(InstallSnapshot {
                term: self.term_clock.current(),
                leader_id: self.id,
                last_included_index: snapshot.last_index,
                last_included_term: snapshot.last_term,
                membership: snapshot.membership.clone(),
                data: snapshot.data.clone(),
            }));
        }

        let prev_index = next.prev().unwrap_or(LogIndex::ZERO);
        let prev_term = self.log.term_at(prev_index).unwrap_or(Term::ZERO);
        Some(Message::AppendEntries(AppendEntries {
            term: self.term_clock.current(),
            leader_id: self.id,
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries: self.log.entries_from(next).to_vec(),
            leader_commit: self.commit_index,
            read_seq: leader.current_read_seq(),
        }))
    }

    fn send_append_to(&self, peer: NodeId) -> Vec<Action<C>> {
        self.build_append_for(peer)
            .map(|message| vec![Action::Send { to: peer, message }])
            .unwrap_or_default()
    }

    fn broadcast_appends(&self) -> Vec<Action<C>> {
        self.membership
            .peers(self.id)
            .into_iter()
            .filter_map(|peer| {
                self.build_append_for(peer)
                    .map(|message| Action::Send { to: peer, message })
            })
            .collect()
    }

    /// Advance the commit index to the highest entry of the current term
    /// with a write quorum. Entries from earlier terms commit only as a
    /// byproduct.
    fn try_advance_commit(&mut self) -> Vec<Action<C>> {
        if !self.is_leader() {
            return Vec::new();
        }
        let mut candidate = None;
        let mut index = self.log.last_index();
        while index > self.commit_index {
            let acked = match &self.role {
                Role::Leader(leader) => leader.acked_at(index, self.id),
                _ => return Vec::new(),
            };
            if self.quorum.write_satisfied_in(&acked, &self.membership) {
                candidate = Some(index);
                break;
            }
            match index.prev() {
                Some(prev) => index = prev,
                None => break,
            }
        }
        let Some(index) = candidate else {
            return Vec::new();
        };
        if self.log.term_at(index) != Some(self.term_clock.current()) {
            return Vec::new();
        }
        tracing::debug!(node = %self.id, commit = %index, "commit index advanced");
        self.commit_index = index;
        self.after_commit_advanced()
    }

    /// Configuration bookkeeping that triggers on commit: finish a joint
    /// configuration, or step aside once voted out.
    fn after_commit_advanced(&mut self) -> Vec<Action<C>> {
        if !self.is_leader() || self.commit_index < self.config_index {
            return Vec::new();
        }
        if self.membership.is_joint() {
            tracing::info!(
                node = %self.id,
                membership = %self.membership,
                "joint configuration committed, appending final configuration"
            );
            let final_config = self.membership.leave_joint();
            let (_, actions) = self.append_config(final_config);
            return actions;
        }
        if !self.membership.voters().contains(&self.id) {
            tracing::info!(
                node = %self.id,
                membership = %self.membership,
                "removed from committed configuration, stepping down"
            );
            self.become_follower(None);
            return vec![Action::ResetElectionTimer];
        }
        Vec::new()
    }

    fn append_config(&mut self, config: Membership) -> (LogIndex, Vec<Action<C>>) {
        let entry = LogEntry {
            term: self.term_clock.current(),
            index: self.log.last_index().next(),
            request_id: None,
            payload: Payload::Config(config.clone()),
        };
        let index = entry.index;
        self.log.append(entry.clone());
        self.membership = config;
        self.config_index = index;

        let peers = self.membership.peers(self.id);
        let last = self.log.last_index();
        if let Role::Leader(leader) = &mut self.role {
            leader.ensure_progress(&peers, last);
        }

        let mut actions = vec![Action::AppendLogEntries(vec![entry])];
        actions.extend(self.broadcast_appends());
        actions.extend(self.try_advance_commit());
        (index, actions)
    }

    // ---- snapshots ----

    pub fn handle_install_snapshot(&mut self, from: NodeId, request: InstallSnapshot) -> Vec<Action<C>> {
        let mut actions = Vec::new();
        match self.term_clock.observe(request.term) {
            TermCheck::Stale => {
                return vec![Action::Send {
                    to: from,
                    message: Message::InstallSnapshotResponse(InstallSnapshotResponse {
                        term: self.term_clock.current(),
                        match_index: LogIndex::ZERO,
                    }),
                }];
            }
            TermCheck::Advanced => {
                self.become_follower(Some(request.leader_id));
                actions.push(Action::SaveHardState(self.hard_state()));
            }
            TermCheck::Current => match &self.role {
                Role::Leader(_) => {
                    tracing::warn!(
                        node = %self.id,
                        other = %request.leader_id,
                        "install snapshot from another leader in our own term, ignoring"
                    );
                    return Vec::new();
                }
                Role::Candidate(_) => self.become_follower(Some(request.leader_id)),
                Role::Follower(_) => {
                    if let Role::Follower(follower) = &mut self.role {
                        follower.leader_id = Some(request.leader_id);
                    }
                }
            },
        }
        actions.push(Action::ResetElectionTimer);

        if request.last_included_index <= self.commit_index {
            // We already hold everything the snapshot covers.
            actions.push(Action::Send {
                to: from,
                message: Message::InstallSnapshotResponse(InstallSnapshotResponse {
                    term: self.term_clock.current(),
                    match_index: request.last_included_index,
                }),
            });
            return actions;
        }

        let snapshot = Snapshot {
            last_index: request.last_included_index,
            last_term: request.last_included_term,
            membership: request.membership,
            data: request.data,
        };
        tracing::info!(
            node = %self.id,
            through = %snapshot.last_index,
            "installing snapshot from leader"
        );
        self.log.install_snapshot(snapshot.clone());
        self.fallback_membership = snapshot.membership.clone();
        self.refresh_config_from_log();
        self.commit_index = self.commit_index.max(snapshot.last_index);
        self.last_applied = self.last_applied.max(snapshot.last_index);
        self.pending_restore = Some(snapshot.clone());

        actions.push(Action::CompactLog(snapshot));
        actions.push(Action::Send {
            to: from,
            message: Message::InstallSnapshotResponse(InstallSnapshotResponse {
                term: self.term_clock.current(),
                match_index: request.last_included_index,
            }),
        });
        actions
    }

    /// Replace the applied prefix with a snapshot taken at `through`.
    ///
    /// `data` must be the state machine image at exactly `through`, which
    /// is capped at `last_applied`. A no-op when there is nothing new to
    /// compact.
    pub fn compact(&mut self, through: LogIndex, data: Vec<u8>) -> Vec<Action<C>> {
        let through = through.min(self.last_applied);
        if through <= self.log.snapshot_index() {
            return Vec::new();
        }
        let Some(term) = self.log.term_at(through) else {
            return Vec::new();
        };
        let membership = match self.log.latest_config_at_or_below(through) {
            Some((_, config)) => config.clone(),
            None => self.fallback_membership.clone(),
        };
        let snapshot = Snapshot {
            last_index: through,
            last_term: term,
            membership,
            data,
        };
        self.log.install_snapshot(snapshot.clone());
        self.fallback_membership = snapshot.membership.clone();
        self.refresh_config_from_log();
        if let Role::Leader(leader) = &mut self.role {
            leader.forget_through(through);
        }
        tracing::info!(node = %self.id, through = %through, "compacted log");
        vec![Action::CompactLog(snapshot)]
    }

    // ---- client operations ----

    /// Propose a command. Returns the index it will commit at, plus the
    /// actions that start replicating it. A request id that was already
    /// accepted returns its original index with no new entry.
    pub fn submit(
        &mut self,
        command: C,
        request_id: Option<RequestId>,
    ) -> Result<(LogIndex, Vec<Action<C>>), ProposeError> {
        let hint = self.leader_hint();
        let Role::Leader(leader) = &mut self.role else {
            return Err(ProposeError::NotLeader { hint });
        };
        if let Some(id) = request_id {
            if let Some(existing) = leader.known_request(id) {
                tracing::debug!(node = %self.id, request = %id, index = %existing, "duplicate submission");
                return Ok((existing, Vec::new()));
            }
        }
        let entry = LogEntry {
            term: self.term_clock.current(),
            index: self.log.last_index().next(),
            request_id,
            payload: Payload::Command(command),
        };
        let index = entry.index;
        if let Some(id) = request_id {
            leader.remember_request(id, index);
        }
        self.log.append(entry.clone());

        let mut actions = vec![Action::AppendLogEntries(vec![entry])];
        actions.extend(self.broadcast_appends());
        actions.extend(self.try_advance_commit());
        Ok((index, actions))
    }

    /// Register a strong read. It is answered only after a read quorum
    /// confirms this leader's authority and the captured index is applied.
    pub fn submit_query(&mut self, query: C) -> Result<(ReadSeq, Vec<Action<C>>), ProposeError> {
        let hint = self.leader_hint();
        let commit = self.commit_index;
        let Role::Leader(leader) = &mut self.role else {
            return Err(ProposeError::NotLeader { hint });
        };
        // The no-op gate: never read below the start of our own term, or a
        // fresher leader's committed writes could be missed.
        let read_index = commit.max(leader.term_start);
        let seq = leader.issue_read(read_index, query);
        Ok((seq, self.broadcast_appends()))
    }

    /// Start the two-phase switch to `new_voters`. Returns the index of the
    /// joint entry; the final configuration is appended automatically when
    /// the joint one commits.
    pub fn change_membership(
        &mut self,
        new_voters: BTreeSet<NodeId>,
    ) -> Result<(LogIndex, Vec<Action<C>>), ProposeError> {
        if new_voters.is_empty() {
            return Err(ProposeError::InvalidMembership);
        }
        if !self.is_leader() {
            return Err(ProposeError::NotLeader {
                hint: self.leader_hint(),
            });
        }
        if self.membership.is_joint() || self.config_index > self.commit_index {
            return Err(ProposeError::ReconfigInProgress);
        }
        let joint = self.membership.enter_joint(new_voters);
        tracing::info!(node = %self.id, membership = %joint, "entering joint configuration");
        Ok(self.append_config(joint))
    }

    // ---- apply pipeline ----

    /// Next unit of work for the state machine, or `None` when caught up.
    /// A pending snapshot restore always comes before further entries.
    pub fn take_apply_item(&mut self) -> Option<ApplyItem<C>> {
        if let Some(snapshot) = self.pending_restore.take() {
            return Some(ApplyItem::Snapshot(snapshot));
        }
        if self.last_applied < self.commit_index {
            let next = self.last_applied.next();
            let entry = self.log.entry(next)?.clone();
            self.last_applied = next;
            return Some(ApplyItem::Entry(entry));
        }
        None
    }

    /// Strong reads whose quorum round completed and whose read index has
    /// been applied. Call after draining apply items.
    pub fn take_serveable_reads(&mut self) -> Vec<(ReadSeq, C)> {
        let me = self.id;
        let applied = self.last_applied;
        match &mut self.role {
            Role::Leader(leader) => leader.release_reads(me, applied, &self.membership, &self.quorum),
            _ => Vec::new(),
        }
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.term_clock.current(),
            voted_for: self.term_clock.voted_for(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[u64]) -> BTreeSet<NodeId> {
        values.iter().map(|&v| NodeId::from(v)).collect()
    }

    fn membership(values: &[u64]) -> Membership {
        Membership::new(ids(values))
    }

    fn node(id: u64, voters: &[u64]) -> Node<String> {
        Node::new(NodeId::from(id), membership(voters), QuorumPolicy::default())
    }

    /// Time out and collect votes from every peer.
    fn lead(n: &mut Node<String>) -> Vec<Action<String>> {
        let mut actions = n.election_timeout();
        let term = n.current_term();
        for peer in n.membership().peers(n.id()) {
            actions.extend(n.handle_request_vote_response(
                peer,
                RequestVoteResponse {
                    term,
                    vote_granted: true,
                },
            ));
        }
        assert!(n.is_leader());
        actions
    }

    fn sends(actions: &[Action<String>]) -> Vec<(NodeId, Message<String>)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { to, message } => Some((*to, message.clone())),
                _ => None,
            })
            .collect()
    }

    fn ack_all(n: &mut Node<String>) -> Vec<Action<String>> {
        let term = n.current_term();
        let match_index = n.log().last_index();
        let read_seq = match &n.role {
            Role::Leader(leader) => leader.current_read_seq(),
            _ => ReadSeq::NONE,
        };
        let mut actions = Vec::new();
        for peer in n.membership().peers(n.id()) {
            actions.extend(n.handle_append_entries_response(
                peer,
                AppendEntriesResponse {
                    term,
                    success: true,
                    match_index,
                    conflict_index: LogIndex::ZERO,
                    conflict_term: None,
                    read_seq,
                },
            ));
        }
        actions
    }

    fn drain_applied(n: &mut Node<String>) -> Vec<ApplyItem<String>> {
        let mut items = Vec::new();
        while let Some(item) = n.take_apply_item() {
            items.push(item);
        }
        items
    }

    #[test]
    fn follower_campaigns_on_timeout() {
        let mut n = node(1, &[1, 2, 3]);

        let actions = n.election_timeout();

        assert_eq!(n.current_term(), Term::from(1));
        assert!(matches!(n.role, Role::Candidate(_)));
        // Hard state goes down before any vote request goes out.
        assert!(matches!(actions[0], Action::SaveHardState(hs) if hs.term == Term::from(1)));
        let requests = sends(&actions);
        assert_eq!(requests.len(), 2);
        for (_, message) in &requests {
            assert!(matches!(message, Message::RequestVote(_)));
        }
    }

    #[test]
    fn majority_of_votes_wins_and_appends_noop() {
        let mut n = node(1, &[1, 2, 3]);
        n.election_timeout();
        let term = n.current_term();

        let actions = n.handle_request_vote_response(
            NodeId::from(2),
            RequestVoteResponse {
                term,
                vote_granted: true,
            },
        );

        assert!(n.is_leader());
        let noop = n.log().entry(LogIndex::from(1)).unwrap();
        assert_eq!(noop.payload, Payload::Noop);
        assert_eq!(noop.term, term);
        // The new leader immediately replicates to both peers.
        assert_eq!(sends(&actions).len(), 2);
    }

    #[test]
    fn single_node_cluster_elects_itself() {
        let mut n = node(1, &[1]);

        n.election_timeout();

        assert!(n.is_leader());
        assert_eq!(n.commit_index(), LogIndex::from(1));
    }

    #[test]
    fn one_vote_per_term() {
        let mut n = node(3, &[1, 2, 3]);
        let request = |candidate: u64| RequestVote {
            term: Term::from(1),
            candidate_id: NodeId::from(candidate),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        };

        let first = sends(&n.handle_request_vote(NodeId::from(1), request(1)));
        let second = sends(&n.handle_request_vote(NodeId::from(2), request(2)));
        let repeat = sends(&n.handle_request_vote(NodeId::from(1), request(1)));

        assert!(matches!(first[0].1, Message::RequestVoteResponse(ref r) if r.vote_granted));
        assert!(matches!(second[0].1, Message::RequestVoteResponse(ref r) if !r.vote_granted));
        // Same candidate asking again gets the same grant.
        assert!(matches!(repeat[0].1, Message::RequestVoteResponse(ref r) if r.vote_granted));
    }

    #[test]
    fn vote_denied_to_stale_log() {
        let mut n = node(2, &[1, 2, 3]);
        lead(&mut n);
        let term = n.current_term();
        n.handle_request_vote(
            NodeId::from(3),
            RequestVote {
                term: term.increment(),
                candidate_id: NodeId::from(3),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            },
        );

        // Candidate's log (empty) is behind ours (holds the noop).
        assert!(!n.is_leader());
        let responses = sends(&n.handle_request_vote(
            NodeId::from(3),
            RequestVote {
                term: term.increment(),
                candidate_id: NodeId::from(3),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            },
        ));
        assert!(
            matches!(responses[0].1, Message::RequestVoteResponse(ref r) if !r.vote_granted)
        );
    }

    #[test]
    fn vote_granted_to_longer_log_in_same_last_term() {
        let mut n = node(2, &[1, 2, 3]);

        let responses = sends(&n.handle_request_vote(
            NodeId::from(1),
            RequestVote {
                term: Term::from(1),
                candidate_id: NodeId::from(1),
                last_log_index: LogIndex::from(5),
                last_log_term: Term::ZERO,
            },
        ));

        assert!(matches!(responses[0].1, Message::RequestVoteResponse(ref r) if r.vote_granted));
    }

    #[test]
    fn commit_waits_for_write_quorum() {
        let mut n = node(1, &[1, 2, 3]);
        lead(&mut n);
        ack_all(&mut n); // commit the noop

        let (index, _) = n.submit("set x".to_string(), None).unwrap();
        assert_eq!(n.commit_index(), LogIndex::from(1));

        let term = n.current_term();
        n.handle_append_entries_response(
            NodeId::from(2),
            AppendEntriesResponse {
                term,
                success: true,
                match_index: index,
                conflict_index: LogIndex::ZERO,
                conflict_term: None,
                read_seq: ReadSeq::NONE,
            },
        );

        // Leader + one follower = majority of three.
        assert_eq!(n.commit_index(), index);
        let items = drain_applied(&mut n);
        assert!(matches!(
            items.last(),
            Some(ApplyItem::Entry(e)) if e.index == index
        ));
    }

    #[test]
    fn earlier_term_entries_commit_only_via_current_term() {
        // A leader inherits an uncommitted entry from term 1, wins term 2,
        // and must not commit the old entry until its own noop commits.
        let persisted = PersistedState {
            hard_state: HardState {
                term: Term::from(1),
                voted_for: None,
            },
            snapshot: None,
            entries: vec![LogEntry {
                term: Term::from(1),
                index: LogIndex::from(1),
                request_id: None,
                payload: Payload::Command("old".to_string()),
            }],
        };
        let mut n: Node<String> = Node::restore(
            NodeId::from(1),
            membership(&[1, 2, 3]),
            QuorumPolicy::default(),
            persisted,
        );
        lead(&mut n);
        let term = n.current_term();

        // Follower 2 acks only the old entry, giving it a majority.
        n.handle_append_entries_response(
            NodeId::from(2),
            AppendEntriesResponse {
                term,
                success: true,
                match_index: LogIndex::from(1),
                conflict_index: LogIndex::ZERO,
                conflict_term: None,
                read_seq: ReadSeq::NONE,
            },
        );
        assert_eq!(n.commit_index(), LogIndex::ZERO);

        // Acking the noop commits both.
        n.handle_append_entries_response(
            NodeId::from(2),
            AppendEntriesResponse {
                term,
                success: true,
                match_index: LogIndex::from(2),
                conflict_index: LogIndex::ZERO,
                conflict_term: None,
                read_seq: ReadSeq::NONE,
            },
        );
        assert_eq!(n.commit_index(), LogIndex::from(2));
    }

    #[test]
    fn append_entries_adopts_leader_and_replies_success() {
        let mut n = node(2, &[1, 2, 3]);

        let actions = n.handle_append_entries(
            NodeId::from(1),
            AppendEntries {
                term: Term::from(1),
                leader_id: NodeId::from(1),
                prev_log_index: LogIndex::ZERO,
                prev_log_term: Term::ZERO,
                entries: vec![LogEntry {
                    term: Term::from(1),
                    index: LogIndex::from(1),
                    request_id: None,
                    payload: Payload::Command("a".to_string()),
                }],
                leader_commit: LogIndex::from(1),
                read_seq: ReadSeq::NONE,
            },
        );

        assert_eq!(n.current_term(), Term::from(1));
        assert_eq!(n.leader_hint(), Some(NodeId::from(1)));
        assert_eq!(n.commit_index(), LogIndex::from(1));
        let responses = sends(&actions);
        assert!(matches!(
            responses.last().unwrap().1,
            Message::AppendEntriesResponse(ref r)
                if r.success && r.match_index == LogIndex::from(1)
        ));
    }

    #[test]
    fn append_entries_rejects_mismatch_with_conflict_hint() {
        let mut n = node(2, &[1, 2, 3]);
        // Local log: two entries of term 1.
        for index in 1..=2u64 {
            n.handle_append_entries(
                NodeId::from(1),
                AppendEntries {
                    term: Term::from(1),
                    leader_id: NodeId::from(1),
                    prev_log_index: LogIndex::from(index - 1),
                    prev_log_term: if index == 1 { Term::ZERO } else { Term::from(1) },
                    entries: vec![LogEntry {
                        term: Term::from(1),
                        index: LogIndex::from(index),
                        request_id: None,
                        payload: Payload::Command(format!("c{index}")),
                    }],
                    leader_commit: LogIndex::ZERO,
                    read_seq: ReadSeq::NONE,
                },
            );
        }

        // New leader probes with prev at index 2 term 2: term mismatch.
        let actions = n.handle_append_entries(
            NodeId::from(3),
            AppendEntries {
                term: Term::from(2),
                leader_id: NodeId::from(3),
                prev_log_index: LogIndex::from(2),
                prev_log_term: Term::from(2),
                entries: Vec::new(),
                leader_commit: LogIndex::ZERO,
                read_seq: ReadSeq::NONE,
            },
        );

        let responses = sends(&actions);
        match &responses.last().unwrap().1 {
            Message::AppendEntriesResponse(r) => {
                assert!(!r.success);
                assert_eq!(r.conflict_term, Some(Term::from(1)));
                assert_eq!(r.conflict_index, LogIndex::from(1));
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        // A probe past our end hints with last+1 and no term.
        let actions = n.handle_append_entries(
            NodeId::from(3),
            AppendEntries {
                term: Term::from(2),
                leader_id: NodeId::from(3),
                prev_log_index: LogIndex::from(9),
                prev_log_term: Term::from(2),
                entries: Vec::new(),
                leader_commit: LogIndex::ZERO,
                read_seq: ReadSeq::NONE,
            },
        );
        let responses = sends(&actions);
        match &responses.last().unwrap().1 {
            Message::AppendEntriesResponse(r) => {
                assert!(!r.success);
                assert_eq!(r.conflict_term, None);
                assert_eq!(r.conflict_index, LogIndex::from(3));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn conflicting_suffix_is_truncated() {
        let mut n = node(2, &[1, 2, 3]);
        n.handle_append_entries(
            NodeId::from(1),
            AppendEntries {
                term: Term::from(1),
                leader_id: NodeId::from(1),
                prev_log_index: LogIndex::ZERO,
                prev_log_term: Term::ZERO,
                entries: vec![
                    LogEntry {
                        term: Term::from(1),
                        index: LogIndex::from(1),
                        request_id: None,
                        payload: Payload::Command("keep".to_string()),
                    },
                    LogEntry {
                        term: Term::from(1),
                        index: LogIndex::from(2),
                        request_id: None,
                        payload: Payload::Command("stale".to_string()),
                    },
                ],
                leader_commit: LogIndex::ZERO,
                read_seq: ReadSeq::NONE,
            },
        );

        // A term-2 leader overwrites index 2.
        let actions = n.handle_append_entries(
            NodeId::from(3),
            AppendEntries {
                term: Term::from(2),
                leader_id: NodeId::from(3),
                prev_log_index: LogIndex::from(1),
                prev_log_term: Term::from(1),
                entries: vec![LogEntry {
                    term: Term::from(2),
                    index: LogIndex::from(2),
                    request_id: None,
                    payload: Payload::Command("fresh".to_string()),
                }],
                leader_commit: LogIndex::ZERO,
                read_seq: ReadSeq::NONE,
            },
        );

        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::TruncateLog { from } if *from == LogIndex::from(2))));
        assert_eq!(n.log().last_index(), LogIndex::from(2));
        assert_eq!(n.log().term_at(LogIndex::from(2)), Some(Term::from(2)));
        match &n.log().entry(LogIndex::from(2)).unwrap().payload {
            Payload::Command(c) => assert_eq!(c, "fresh"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn duplicate_append_is_idempotent() {
        let mut n = node(2, &[1, 2, 3]);
        let request = AppendEntries {
            term: Term::from(1),
            leader_id: NodeId::from(1),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![LogEntry {
                term: Term::from(1),
                index: LogIndex::from(1),
                request_id: None,
                payload: Payload::Command("a".to_string()),
            }],
            leader_commit: LogIndex::ZERO,
            read_seq: ReadSeq::NONE,
        };

        n.handle_append_entries(NodeId::from(1), request.clone());
        let again = n.handle_append_entries(NodeId::from(1), request);

        // No truncate, no append, still a success reply at the same match.
        assert!(!again
            .iter()
            .any(|a| matches!(a, Action::TruncateLog { .. } | Action::AppendLogEntries(_))));
        let responses = sends(&again);
        assert!(matches!(
            responses.last().unwrap().1,
            Message::AppendEntriesResponse(ref r)
                if r.success && r.match_index == LogIndex::from(1)
        ));
        assert_eq!(n.log().retained_len(), 1);
    }

    #[test]
    fn leader_steps_down_on_higher_term_response() {
        let mut n = node(1, &[1, 2, 3]);
        lead(&mut n);
        let higher = n.current_term().increment();

        let actions = n.handle_append_entries_response(
            NodeId::from(2),
            AppendEntriesResponse {
                term: higher,
                success: false,
                match_index: LogIndex::ZERO,
                conflict_index: LogIndex::ZERO,
                conflict_term: None,
                read_seq: ReadSeq::NONE,
            },
        );

        assert!(!n.is_leader());
        assert_eq!(n.current_term(), higher);
        assert!(matches!(actions[0], Action::SaveHardState(_)));
    }

    #[test]
    fn stale_responses_are_dropped() {
        let mut n = node(1, &[1, 2, 3]);
        lead(&mut n);

        let actions = n.handle_append_entries_response(
            NodeId::from(2),
            AppendEntriesResponse {
                term: Term::ZERO,
                success: true,
                match_index: LogIndex::from(7),
                conflict_index: LogIndex::ZERO,
                conflict_term: None,
                read_seq: ReadSeq::NONE,
            },
        );

        assert!(actions.is_empty());
        assert_eq!(n.commit_index(), LogIndex::ZERO);
    }

    #[test]
    fn conflict_hint_fast_retreat() {
        let mut n = node(1, &[1, 2, 3]);
        lead(&mut n);
        for i in 0..3 {
            n.submit(format!("c{i}"), None).unwrap();
        }
        let term = n.current_term();

        // Follower rejects with a term the leader never wrote; the hint
        // does not move us, so the leader steps back one entry.
        let actions = n.handle_append_entries_response(
            NodeId::from(2),
            AppendEntriesResponse {
                term,
                success: false,
                match_index: LogIndex::ZERO,
                conflict_index: LogIndex::from(2),
                conflict_term: Some(Term::from(99)),
                read_seq: ReadSeq::NONE,
            },
        );

        let resend = sends(&actions);
        match &resend[0].1 {
            Message::AppendEntries(req) => {
                assert_eq!(req.prev_log_index, LogIndex::ZERO);
                assert_eq!(req.entries.len(), 4);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // A hint naming a term the leader does hold jumps past the
        // leader's last entry of it.
        let actions = n.handle_append_entries_response(
            NodeId::from(3),
            AppendEntriesResponse {
                term,
                success: false,
                match_index: LogIndex::ZERO,
                conflict_index: LogIndex::from(1),
                conflict_term: Some(term),
                read_seq: ReadSeq::NONE,
            },
        );
        let resend = sends(&actions);
        match &resend[0].1 {
            Message::AppendEntries(req) => {
                // next = last_index_of_term(term) + 1 clamps back to one
                // step before the previous probe.
                assert_eq!(req.prev_log_index, LogIndex::ZERO);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn duplicate_submission_returns_original_index() {
        let mut n = node(1, &[1, 2, 3]);
        lead(&mut n);
        let request_id = RequestId::from(42u128);

        let (first, _) = n.submit("pay".to_string(), Some(request_id)).unwrap();
        let (second, actions) = n.submit("pay".to_string(), Some(request_id)).unwrap();

        assert_eq!(first, second);
        assert!(actions.is_empty());
        assert_eq!(n.log().last_index(), first);
    }

    #[test]
    fn dedup_survives_reelection() {
        let mut n = node(1, &[1, 2, 3]);
        lead(&mut n);
        let request_id = RequestId::from(7u128);
        let (index, _) = n.submit("once".to_string(), Some(request_id)).unwrap();

        // Lose leadership, win it back in a later term.
        n.handle_append_entries_response(
            NodeId::from(2),
            AppendEntriesResponse {
                term: n.current_term().increment(),
                success: false,
                match_index: LogIndex::ZERO,
                conflict_index: LogIndex::ZERO,
                conflict_term: None,
                read_seq: ReadSeq::NONE,
            },
        );
        lead(&mut n);

        let (again, actions) = n.submit("once".to_string(), Some(request_id)).unwrap();
        assert_eq!(again, index);
        assert!(actions.is_empty());
    }

    #[test]
    fn submit_refused_by_followers_with_hint() {
        let mut n = node(2, &[1, 2, 3]);
        n.handle_append_entries(
            NodeId::from(1),
            AppendEntries {
                term: Term::from(1),
                leader_id: NodeId::from(1),
                prev_log_index: LogIndex::ZERO,
                prev_log_term: Term::ZERO,
                entries: Vec::new(),
                leader_commit: LogIndex::ZERO,
                read_seq: ReadSeq::NONE,
            },
        );

        let err = n.submit("x".to_string(), None).unwrap_err();

        assert_eq!(
            err,
            ProposeError::NotLeader {
                hint: Some(NodeId::from(1))
            }
        );
    }

    #[test]
    fn read_waits_for_quorum_confirmation() {
        let mut n = node(1, &[1, 2, 3]);
        lead(&mut n);
        ack_all(&mut n);
        drain_applied(&mut n);

        let (seq, actions) = n.submit_query("get x".to_string()).unwrap();
        // The confirmation round carries the new sequence.
        let heartbeats = sends(&actions);
        assert_eq!(heartbeats.len(), 2);
        for (_, message) in &heartbeats {
            assert!(matches!(
                message,
                Message::AppendEntries(req) if req.read_seq == seq
            ));
        }
        assert!(n.take_serveable_reads().is_empty());

        // One echo is enough for a majority of three.
        let term = n.current_term();
        n.handle_append_entries_response(
            NodeId::from(2),
            AppendEntriesResponse {
                term,
                success: true,
                match_index: n.log().last_index(),
                conflict_index: LogIndex::ZERO,
                conflict_term: None,
                read_seq: seq,
            },
        );

        let served = n.take_serveable_reads();
        assert_eq!(served.len(), 1);
        assert_eq!(served[0], (seq, "get x".to_string()));
    }

    #[test]
    fn read_blocked_until_noop_applies() {
        let mut n = node(1, &[1, 2, 3]);
        lead(&mut n);
        // Noop not yet committed or applied.
        let (seq, _) = n.submit_query("get".to_string()).unwrap();
        let term = n.current_term();
        n.handle_append_entries_response(
            NodeId::from(2),
            AppendEntriesResponse {
                term,
                success: true,
                match_index: n.log().last_index(),
                conflict_index: LogIndex::ZERO,
                conflict_term: None,
                read_seq: seq,
            },
        );

        // Quorum confirmed but the read index is not applied yet.
        assert!(n.take_serveable_reads().is_empty());
        drain_applied(&mut n);
        assert_eq!(n.take_serveable_reads().len(), 1);
    }

    #[test]
    fn membership_change_runs_both_phases() {
        let mut n = node(1, &[1, 2, 3]);
        lead(&mut n);
        ack_all(&mut n);

        let (joint_index, _) = n.change_membership(ids(&[1, 2, 4])).unwrap();
        assert!(n.membership().is_joint());

        // A second change is refused while the first is in flight.
        assert_eq!(
            n.change_membership(ids(&[1, 2])).unwrap_err(),
            ProposeError::ReconfigInProgress
        );

        // Joint commit needs majorities in {1,2,3} and {1,2,4}.
        let term = n.current_term();
        for peer in [2u64, 4] {
            n.handle_append_entries_response(
                NodeId::from(peer),
                AppendEntriesResponse {
                    term,
                    success: true,
                    match_index: joint_index,
                    conflict_index: LogIndex::ZERO,
                    conflict_term: None,
                    read_seq: ReadSeq::NONE,
                },
            );
        }

        // The final configuration was appended automatically.
        assert!(!n.membership().is_joint());
        assert_eq!(n.membership().voters(), &ids(&[1, 2, 4]));
        let final_index = n.log().last_index();
        match &n.log().entry(final_index).unwrap().payload {
            Payload::Config(config) => assert!(!config.is_joint()),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn leader_steps_down_when_voted_out() {
        let mut n = node(1, &[1, 2, 3]);
        lead(&mut n);
        ack_all(&mut n);

        let (joint_index, _) = n.change_membership(ids(&[2, 3])).unwrap();
        let term = n.current_term();
        for peer in [2u64, 3] {
            n.handle_append_entries_response(
                NodeId::from(peer),
                AppendEntriesResponse {
                    term,
                    success: true,
                    match_index: joint_index,
                    conflict_index: LogIndex::ZERO,
                    conflict_term: None,
                    read_seq: ReadSeq::NONE,
                },
            );
        }
        // Joint committed; final config appended. Acking the final entry
        // commits it and the leader, now an outsider, steps down.
        assert!(n.is_leader());
        let final_index = n.log().last_index();
        for peer in [2u64, 3] {
            n.handle_append_entries_response(
                NodeId::from(peer),
                AppendEntriesResponse {
                    term,
                    success: true,
                    match_index: final_index,
                    conflict_index: LogIndex::ZERO,
                    conflict_term: None,
                    read_seq: ReadSeq::NONE,
                },
            );
        }

        assert!(!n.is_leader());
        // And it never campaigns again from outside the voter set.
        let actions = n.election_timeout();
        assert_eq!(actions, vec![Action::ResetElectionTimer]);
        assert!(!n.is_leader());
    }

    #[test]
    fn truncation_reverts_uncommitted_config() {
        let mut n = node(2, &[1, 2, 3]);
        // Leader 1 appends a joint config entry which node 2 adopts.
        let joint = membership(&[1, 2, 3]).enter_joint(ids(&[1, 2, 4]));
        n.handle_append_entries(
            NodeId::from(1),
            AppendEntries {
                term: Term::from(1),
                leader_id: NodeId::from(1),
                prev_log_index: LogIndex::ZERO,
                prev_log_term: Term::ZERO,
                entries: vec![LogEntry {
                    term: Term::from(1),
                    index: LogIndex::from(1),
                    request_id: None,
                    payload: Payload::Config(joint.clone()),
                }],
                leader_commit: LogIndex::ZERO,
                read_seq: ReadSeq::NONE,
            },
        );
        assert!(n.membership().is_joint());

        // A later leader overwrites index 1 with a plain command.
        n.handle_append_entries(
            NodeId::from(3),
            AppendEntries {
                term: Term::from(2),
                leader_id: NodeId::from(3),
                prev_log_index: LogIndex::ZERO,
                prev_log_term: Term::ZERO,
                entries: vec![LogEntry {
                    term: Term::from(2),
                    index: LogIndex::from(1),
                    request_id: None,
                    payload: Payload::Command("w".to_string()),
                }],
                leader_commit: LogIndex::ZERO,
                read_seq: ReadSeq::NONE,
            },
        );

        assert!(!n.membership().is_joint());
        assert_eq!(n.membership().voters(), &ids(&[1, 2, 3]));
    }

    #[test]
    fn lagging_follower_gets_snapshot() {
        let mut n = node(1, &[1, 2, 3]);
        lead(&mut n);
        ack_all(&mut n);
        for i in 0..4 {
            let (index, _) = n.submit(format!("c{i}"), None).unwrap();
            let term = n.current_term();
            // Only follower 2 keeps up.
            n.handle_append_entries_response(
                NodeId::from(2),
                AppendEntriesResponse {
                    term,
                    success: true,
                    match_index: index,
                    conflict_index: LogIndex::ZERO,
                    conflict_term: None,
                    read_seq: ReadSeq::NONE,
                },
            );
        }
        drain_applied(&mut n);
        let actions = n.compact(n.last_applied(), b"image".to_vec());
        assert!(matches!(actions[0], Action::CompactLog(_)));

        // Follower 3 rejects from far behind; its next entry is compacted.
        let term = n.current_term();
        let actions = n.handle_append_entries_response(
            NodeId::from(3),
            AppendEntriesResponse {
                term,
                success: false,
                match_index: LogIndex::ZERO,
                conflict_index: LogIndex::from(1),
                conflict_term: None,
                read_seq: ReadSeq::NONE,
            },
        );

        let resend = sends(&actions);
        match &resend[0].1 {
            Message::InstallSnapshot(req) => {
                assert_eq!(req.last_included_index, n.log().snapshot_index());
                assert_eq!(req.data, b"image".to_vec());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn follower_installs_snapshot_and_queues_restore() {
        let mut n = node(3, &[1, 2, 3]);

        let actions = n.handle_install_snapshot(
            NodeId::from(1),
            InstallSnapshot {
                term: Term::from(2),
                leader_id: NodeId::from(1),
                last_included_index: LogIndex::from(5),
                last_included_term: Term::from(2),
                membership: membership(&[1, 2, 3]),
                data: b"image".to_vec(),
            },
        );

        assert_eq!(n.commit_index(), LogIndex::from(5));
        assert_eq!(n.last_applied(), LogIndex::from(5));
        assert_eq!(n.log().snapshot_index(), LogIndex::from(5));
        assert!(actions.iter().any(|a| matches!(a, Action::CompactLog(_))));
        let responses = sends(&actions);
        assert!(matches!(
            responses.last().unwrap().1,
            Message::InstallSnapshotResponse(ref r) if r.match_index == LogIndex::from(5)
        ));
        // The restore is handed to the state machine before anything else.
        assert!(matches!(
            n.take_apply_item(),
            Some(ApplyItem::Snapshot(s)) if s.data == b"image".to_vec()
        ));
    }

    #[test]
    fn stale_snapshot_is_acknowledged_not_installed() {
        let mut n = node(2, &[1, 2, 3]);
        for index in 1..=3u64 {
            n.handle_append_entries(
                NodeId::from(1),
                AppendEntries {
                    term: Term::from(1),
                    leader_id: NodeId::from(1),
                    prev_log_index: LogIndex::from(index - 1),
                    prev_log_term: if index == 1 { Term::ZERO } else { Term::from(1) },
                    entries: vec![LogEntry {
                        term: Term::from(1),
                        index: LogIndex::from(index),
                        request_id: None,
                        payload: Payload::Command(format!("c{index}")),
                    }],
                    leader_commit: LogIndex::from(index),
                    read_seq: ReadSeq::NONE,
                },
            );
        }
        drain_applied(&mut n);

        let actions = n.handle_install_snapshot(
            NodeId::from(1),
            InstallSnapshot {
                term: Term::from(1),
                leader_id: NodeId::from(1),
                last_included_index: LogIndex::from(2),
                last_included_term: Term::from(1),
                membership: membership(&[1, 2, 3]),
                data: b"old".to_vec(),
            },
        );

        // Acked at the snapshot index, but nothing was thrown away.
        assert!(!actions.iter().any(|a| matches!(a, Action::CompactLog(_))));
        assert_eq!(n.log().retained_len(), 3);
        assert!(n.take_apply_item().is_none());
    }

    #[test]
    fn compaction_keeps_suffix_and_serves_from_boundary() {
        let mut n = node(1, &[1, 2, 3]);
        lead(&mut n);
        ack_all(&mut n);
        for i in 0..3 {
            let (index, _) = n.submit(format!("c{i}"), None).unwrap();
            let term = n.current_term();
            n.handle_append_entries_response(
                NodeId::from(2),
                AppendEntriesResponse {
                    term,
                    success: true,
                    match_index: index,
                    conflict_index: LogIndex::ZERO,
                    conflict_term: None,
                    read_seq: ReadSeq::NONE,
                },
            );
        }
        drain_applied(&mut n);
        let last = n.log().last_index();

        // Compact through an index below the end; the suffix survives.
        let through = last.prev().unwrap();
        let actions = n.compact(through, b"image".to_vec());

        assert_eq!(actions.len(), 1);
        assert_eq!(n.log().snapshot_index(), through);
        assert_eq!(n.log().last_index(), last);
        // Compacting the same prefix again is a no-op.
        assert!(n.compact(through, b"image".to_vec()).is_empty());
    }

    #[test]
    fn append_below_boundary_is_reconciled() {
        let mut n = node(2, &[1, 2, 3]);
        n.handle_install_snapshot(
            NodeId::from(1),
            InstallSnapshot {
                term: Term::from(1),
                leader_id: NodeId::from(1),
                last_included_index: LogIndex::from(4),
                last_included_term: Term::from(1),
                membership: membership(&[1, 2, 3]),
                data: b"image".to_vec(),
            },
        );
        n.take_apply_item();

        // The leader, not yet aware, sends entries 3..=5.
        let actions = n.handle_append_entries(
            NodeId::from(1),
            AppendEntries {
                term: Term::from(1),
                leader_id: NodeId::from(1),
                prev_log_index: LogIndex::from(2),
                prev_log_term: Term::from(1),
                entries: (3..=5u64)
                    .map(|index| LogEntry {
                        term: Term::from(1),
                        index: LogIndex::from(index),
                        request_id: None,
                        payload: Payload::Command(format!("c{index}")),
                    })
                    .collect(),
                leader_commit: LogIndex::from(3),
                read_seq: ReadSeq::NONE,
            },
        );

        // Entries at or below the boundary are skipped, entry 5 lands.
        assert_eq!(n.log().last_index(), LogIndex::from(5));
        assert_eq!(n.log().retained_len(), 1);
        let responses = sends(&actions);
        assert!(matches!(
            responses.last().unwrap().1,
            Message::AppendEntriesResponse(ref r)
                if r.success && r.match_index == LogIndex::from(5)
        ));
    }
}
