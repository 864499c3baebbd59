//! A running replica: the consensus runtime wired to disk storage, the TCP
//! transport, and a channel of client requests.
//!
//! Clients hand in a request with a oneshot for the reply. Writes and
//! configuration changes park on the log index they were proposed at and
//! resolve when that index applies or commits; reads park on their read
//! sequence. Requests that lose their slot to a leadership change stop
//! producing outputs and fall to the deadline sweep.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::action::Action;
use crate::file_storage::{FileStorage, FileStorageError};
use crate::kv::{KvCommand, KvResult, KvStore};
use crate::membership::Membership;
use crate::node::ProposeError;
use crate::quorum::QuorumPolicy;
use crate::runtime::{Event, Output, Runtime, StartError, StateMachine, TimerConfig};
use crate::transport::{Transport, TransportError};
use crate::types::{LogIndex, NodeId, ReadSeq, RequestId};

/// How long a parked request may wait for its commit or read quorum.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("storage: {0}")]
    Storage(#[from] FileStorageError),
    #[error("startup: {0}")]
    Start(#[from] StartError<FileStorageError>),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("config: {0}")]
    Config(String),
    #[error("node halted: {0}")]
    Halted(String),
}

/// What a client may ask of the replica.
#[derive(Debug, PartialEq)]
pub enum ClientRequest {
    /// Apply a write. A `request_id` makes retries of the same write
    /// idempotent across leader reconnects.
    Apply {
        command: KvCommand,
        request_id: Option<RequestId>,
    },
    /// A linearizable read, answered without growing the log.
    Query { query: KvCommand },
    /// Move the cluster to a new voter set.
    ChangeVoters { voters: BTreeSet<NodeId> },
}

#[derive(Debug, PartialEq)]
pub enum ApiResponse {
    Result(KvResult),
    ConfigCommitted,
    /// Retry against `hint` if set, otherwise any node.
    NotLeader { hint: Option<NodeId> },
    /// The request cannot be accepted right now, e.g. a voter change while
    /// another is still committing.
    Rejected { reason: String },
    /// The request was accepted but never completed within its deadline.
    Unavailable,
}

/// A client request paired with the channel its answer goes down.
pub type Pending = (ClientRequest, oneshot::Sender<ApiResponse>);

pub struct Config {
    pub id: u64,
    pub addr: String,
    pub peers: HashMap<String, String>,
    pub data_dir: PathBuf,
    pub quorum: QuorumPolicy,
    pub timers: TimerConfig,
    /// Snapshot once this many entries sit above the last snapshot.
    /// Zero disables compaction.
    pub compaction_threshold: usize,
}

struct Waiter {
    tx: oneshot::Sender<ApiResponse>,
    deadline: Instant,
}

/// A replicated KV node: persistent log on disk, RPCs over TCP.
pub struct Server {
    runtime: Runtime<KvCommand, KvStore, FileStorage<KvCommand>>,
    transport: Transport<KvCommand>,
    client_rx: mpsc::Receiver<Pending>,
    /// Writes and voter changes, keyed by the index they must commit at.
    /// Duplicate submissions of one request id share the index.
    pending_applies: HashMap<LogIndex, Vec<Waiter>>,
    pending_reads: HashMap<ReadSeq, Waiter>,
    compaction_threshold: usize,
}

impl Server {
    /// Open storage, restore persistent state, and bind the RPC listener.
    /// The voter set persisted in the log wins over the bootstrap peers.
    pub fn start(config: Config, client_rx: mpsc::Receiver<Pending>) -> Result<Self, ServerError> {
        let local_id = NodeId::from(config.id);

        config
            .timers
            .validate()
            .map_err(|err| ServerError::Config(err.to_string()))?;

        let addr: SocketAddr = config
            .addr
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid addr '{}': {e}", config.addr)))?;

        let peers = parse_peers(&config.peers)?;
        let mut voters: BTreeSet<NodeId> = peers.keys().copied().collect();
        voters.insert(local_id);

        let storage = FileStorage::open(&config.data_dir)?;
        let runtime = Runtime::from_storage(
            local_id,
            Membership::new(voters),
            config.quorum,
            KvStore::new(),
            storage,
            config.timers,
        )?;

        let transport = Transport::bind(local_id, addr, peers)?;
        let bound = transport.local_addr()?;
        tracing::info!(node = %local_id, addr = %bound, "listening");

        Ok(Self {
            runtime,
            transport,
            client_rx,
            pending_applies: HashMap::new(),
            pending_reads: HashMap::new(),
            compaction_threshold: config.compaction_threshold,
        })
    }

    /// Run the event loop. Returns when storage fails and the node halts.
    pub fn run(&mut self) -> Result<(), ServerError> {
        loop {
            if let Some(reason) = self.runtime.halted_reason() {
                let reason = reason.to_string();
                self.fail_all_pending();
                return Err(ServerError::Halted(reason));
            }

            self.drain_client_requests();
            self.sweep_expired();

            // Drain fired timers before blocking; back-to-back timeouts must
            // not be skipped.
            if let Some(event) = self.runtime.poll_timers() {
                let sends = self.runtime.handle(event);
                self.dispatch(sends);
                self.resolve_outputs();
                continue;
            }

            // Block until the next deadline or an incoming message, capped so
            // the client channel is polled regularly.
            let wait = self
                .runtime
                .next_deadline()
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(5));

            if let Some((from, message)) = self.transport.recv_timeout(wait) {
                let sends = self.runtime.handle(Event::Message { from, message });
                self.dispatch(sends);
                self.resolve_outputs();
            }
        }
    }

    fn drain_client_requests(&mut self) {
        while let Ok((request, tx)) = self.client_rx.try_recv() {
            self.accept(request, tx);
        }
    }

    fn accept(&mut self, request: ClientRequest, tx: oneshot::Sender<ApiResponse>) {
        let deadline = Instant::now() + REQUEST_TIMEOUT;
        match request {
            ClientRequest::Apply {
                command,
                request_id,
            } => {
                let replay = request_id.map(|_| command.clone());
                match self.runtime.submit(command, request_id) {
                    Ok((index, sends)) => {
                        self.dispatch(sends);
                        self.park_apply(index, Waiter { tx, deadline });
                        // A single-voter cluster commits synchronously.
                        self.resolve_outputs();
                        if let Some(command) = replay {
                            self.settle_replayed(index, command);
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(refusal(err));
                    }
                }
            }
            ClientRequest::Query { query } => match self.runtime.submit_query(query) {
                Ok((seq, sends)) => {
                    self.dispatch(sends);
                    self.pending_reads.insert(seq, Waiter { tx, deadline });
                    self.resolve_outputs();
                }
                Err(err) => {
                    let _ = tx.send(refusal(err));
                }
            },
            ClientRequest::ChangeVoters { voters } => {
                match self.runtime.change_membership(voters) {
                    Ok((index, sends)) => {
                        self.dispatch(sends);
                        self.park_apply(index, Waiter { tx, deadline });
                        self.resolve_outputs();
                    }
                    Err(err) => {
                        let _ = tx.send(refusal(err));
                    }
                }
            }
        }
    }

    fn park_apply(&mut self, index: LogIndex, waiter: Waiter) {
        self.pending_applies.entry(index).or_default().push(waiter);
    }

    /// A retried request whose entry applied before the retry arrived gets
    /// no fresh output; answer it from the state machine as it stands.
    fn settle_replayed(&mut self, index: LogIndex, command: KvCommand) {
        if index > self.runtime.node().last_applied() {
            return;
        }
        if let Some(waiters) = self.pending_applies.remove(&index) {
            let output = self.runtime.state_machine().query(command);
            for waiter in waiters {
                let _ = waiter.tx.send(ApiResponse::Result(output.clone()));
            }
        }
    }

    /// Resolve parked requests against the outputs of applied work, then
    /// compact if the log has grown past the threshold.
    fn resolve_outputs(&mut self) {
        for output in self.runtime.take_outputs() {
            match output {
                Output::Applied { index, output } => {
                    for waiter in self.pending_applies.remove(&index).unwrap_or_default() {
                        let _ = waiter.tx.send(ApiResponse::Result(output.clone()));
                    }
                }
                Output::ConfigCommitted { index } => {
                    for waiter in self.pending_applies.remove(&index).unwrap_or_default() {
                        let _ = waiter.tx.send(ApiResponse::ConfigCommitted);
                    }
                }
                Output::ReadServed { seq, output } => {
                    if let Some(waiter) = self.pending_reads.remove(&seq) {
                        let _ = waiter.tx.send(ApiResponse::Result(output));
                    }
                }
            }
        }
        self.maybe_compact();
    }

    fn maybe_compact(&mut self) {
        if self.compaction_threshold == 0 {
            return;
        }
        if self.runtime.node().log().retained_len() >= self.compaction_threshold
            && self.runtime.compact()
        {
            tracing::info!(
                node = %self.runtime.node().id(),
                through = %self.runtime.node().last_applied(),
                "compacted log"
            );
        }
    }

    /// Time out requests whose entry was truncated away or whose read quorum
    /// never formed.
    fn sweep_expired(&mut self) {
        let now = Instant::now();
        for waiters in self.pending_applies.values_mut() {
            let mut kept = Vec::new();
            for waiter in waiters.drain(..) {
                if waiter.deadline <= now {
                    let _ = waiter.tx.send(ApiResponse::Unavailable);
                } else {
                    kept.push(waiter);
                }
            }
            *waiters = kept;
        }
        self.pending_applies.retain(|_, waiters| !waiters.is_empty());

        let expired: Vec<ReadSeq> = self
            .pending_reads
            .iter()
            .filter(|(_, waiter)| waiter.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some(waiter) = self.pending_reads.remove(&seq) {
                let _ = waiter.tx.send(ApiResponse::Unavailable);
            }
        }
    }

    fn fail_all_pending(&mut self) {
        for (_, waiters) in self.pending_applies.drain() {
            for waiter in waiters {
                let _ = waiter.tx.send(ApiResponse::Unavailable);
            }
        }
        for (_, waiter) in self.pending_reads.drain() {
            let _ = waiter.tx.send(ApiResponse::Unavailable);
        }
    }

    /// A send failure must not take the replica down; the peer will be
    /// retried by the next timeout anyway.
    fn dispatch(&self, sends: Vec<Action<KvCommand>>) {
        for action in sends {
            if let Action::Send { to, message } = action {
                if let Err(err) = self.transport.send(to, message) {
                    tracing::warn!(peer = %to, error = %err, "dropping outbound message");
                }
            }
        }
    }
}

fn refusal(err: ProposeError) -> ApiResponse {
    match err {
        ProposeError::NotLeader { hint } => ApiResponse::NotLeader { hint },
        ProposeError::Halted => ApiResponse::Unavailable,
        other => ApiResponse::Rejected {
            reason: other.to_string(),
        },
    }
}

fn parse_peers(raw: &HashMap<String, String>) -> Result<HashMap<NodeId, SocketAddr>, ServerError> {
    raw.iter()
        .map(|(id_str, addr_str)| {
            let id: u64 = id_str
                .parse()
                .map_err(|_| ServerError::Config(format!("invalid peer id: {id_str}")))?;
            let addr: SocketAddr = addr_str.parse().map_err(|e| {
                ServerError::Config(format!("invalid peer addr '{addr_str}': {e}"))
            })?;
            Ok((NodeId::from(id), addr))
        })
        .collect()
}
