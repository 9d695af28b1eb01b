//! Worker runtime and network handling for Raft nodes.
//!
//! Each node runs:
//!
//! - a **worker thread** that owns the [`RaftNode`] and processes client
//!   requests, peer messages and ticks;
//! - a **network listener thread** accepting length-prefixed Raft messages
//!   from peers, with a short-lived handler thread per connection.
//!
//! Threads talk over crossbeam channels so the Raft state machine stays
//! single-threaded. Callers interact through a cloneable [`NodeHandle`].

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use prost::Message as ProstMessage;
use raft::StateRole;
use raft::prelude::Message;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::node::{AppliedChange, ApplyReport, RaftNode};
use crate::payload::{CommandPayload, ProposalTag};

/// Raft logical clock interval: heartbeats every 300ms, elections after ~1s.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound for status and campaign round-trips, which never wait on consensus.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest peer frame accepted; anything above is treated as corrupt.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Identity of a node and how to reach every cluster member.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's id; must appear in `peers`.
    pub id: u64,
    /// Address to bind for incoming Raft messages, e.g. "127.0.0.1:7101".
    pub listen_addr: String,
    /// Node id to network address for all members, including self.
    pub peers: HashMap<u64, String>,
}

/// Snapshot of a node's Raft state and applied data.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: u64,
    pub role: StateRole,
    pub leader_id: u64,
    pub term: u64,
    pub store: BTreeMap<String, String>,
    /// Proposed writes whose callers are still waiting for the apply.
    pub pending_writes: usize,
}

impl NodeStatus {
    pub fn is_leader(&self) -> bool {
        self.role == StateRole::Leader
    }
}

enum WriteOp {
    Put { key: String, value: String },
    Delete { key: String },
}

enum ClientRequest {
    Write {
        op: WriteOp,
        deadline: Instant,
        respond_to: Sender<Result<AppliedChange, StoreError>>,
    },
    Get {
        key: String,
        respond_to: Sender<Result<Option<String>, StoreError>>,
    },
    List {
        respond_to: Sender<Result<BTreeMap<String, String>, StoreError>>,
    },
    Status {
        respond_to: Sender<Result<NodeStatus, StoreError>>,
    },
    Campaign {
        respond_to: Sender<Result<String, StoreError>>,
    },
    Shutdown,
}

/// Handle for sending requests to a running Raft node.
///
/// Every call is bounded by a timeout: a request that the worker never answers
/// (lost leadership, partition) surfaces as [`StoreError::Timeout`].
#[derive(Clone)]
pub struct NodeHandle {
    id: u64,
    request_tx: Sender<ClientRequest>,
}

impl NodeHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Replicates a PUT and blocks until this node has applied it.
    pub fn put(&self, key: String, value: String, timeout: Duration) -> Result<(), StoreError> {
        self.request(timeout, |respond_to| ClientRequest::Write {
            op: WriteOp::Put { key, value },
            deadline: Instant::now() + timeout,
            respond_to,
        })
        .map(|_| ())
    }

    /// Replicates a DELETE and blocks until this node has applied it.
    ///
    /// Returns whether the key existed when the delete was applied. An absent
    /// key still commits.
    pub fn delete(&self, key: String, timeout: Duration) -> Result<bool, StoreError> {
        let change = self.request(timeout, |respond_to| ClientRequest::Write {
            op: WriteOp::Delete { key },
            deadline: Instant::now() + timeout,
            respond_to,
        })?;
        Ok(matches!(change, AppliedChange::Delete { existed: true }))
    }

    /// Reads a key from the leader's applied state.
    pub fn get(&self, key: String, timeout: Duration) -> Result<Option<String>, StoreError> {
        self.request(timeout, |respond_to| ClientRequest::Get { key, respond_to })
    }

    /// Reads every key from the leader's applied state, in key order.
    pub fn list(&self, timeout: Duration) -> Result<BTreeMap<String, String>, StoreError> {
        self.request(timeout, |respond_to| ClientRequest::List { respond_to })
    }

    /// Role, leader, term and store contents of this node. Served by any role.
    pub fn status(&self) -> Result<NodeStatus, StoreError> {
        self.request(CONTROL_TIMEOUT, |respond_to| ClientRequest::Status { respond_to })
    }

    /// Forces this node to start an election.
    pub fn campaign(&self) -> Result<String> {
        self.request(CONTROL_TIMEOUT, |respond_to| ClientRequest::Campaign { respond_to })
            .map_err(|err| anyhow!(err))
            .with_context(|| format!("campaign on node {} failed", self.id))
    }

    /// Signals the worker to stop. Later requests fail with `Unavailable`.
    pub fn shutdown(&self) -> Result<()> {
        self.request_tx
            .send(ClientRequest::Shutdown)
            .context("failed to send shutdown")?;
        Ok(())
    }

    fn request<T>(
        &self,
        timeout: Duration,
        build: impl FnOnce(Sender<Result<T, StoreError>>) -> ClientRequest,
    ) -> Result<T, StoreError> {
        let (resp_tx, resp_rx) = bounded(1);
        self.request_tx
            .send(build(resp_tx))
            .map_err(|_| StoreError::Unavailable(format!("node {} worker stopped", self.id)))?;
        match resp_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(StoreError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::Unavailable(format!(
                "node {} dropped the request",
                self.id
            ))),
        }
    }
}

/// Spawns a Raft node and returns a handle to it.
///
/// Binds the listener before returning so an address in use is reported here
/// rather than from a background thread.
pub fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    if !config.peers.contains_key(&config.id) {
        return Err(anyhow!(
            "listen node id {} missing from peers map",
            config.id
        ));
    }
    let mut voters: Vec<u64> = config.peers.keys().copied().collect();
    voters.sort_unstable();

    let node = RaftNode::new(config.id, &voters)?;
    let (client_tx, client_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();

    let listener = TcpListener::bind(&config.listen_addr)
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    spawn_network_listener(listener, config.listen_addr.clone(), network_tx)?;

    let id = config.id;
    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = Worker::new(node, config.peers, client_rx, network_rx).run() {
                error!(node_id = id, error = ?err, "raft worker crashed");
            }
        })
        .context("failed to spawn raft worker")?;

    info!(node_id = id, listen = %config.listen_addr, "raft node started");
    Ok(NodeHandle {
        id,
        request_tx: client_tx,
    })
}

/// A proposed write whose caller is parked until it applies or its deadline passes.
struct PendingWrite {
    respond_to: Sender<Result<AppliedChange, StoreError>>,
    deadline: Instant,
}

/// Runs the Raft event loop: client requests, peer messages and ticks.
struct Worker {
    node: RaftNode,
    peers: HashMap<u64, String>,
    client_rx: Receiver<ClientRequest>,
    network_rx: Receiver<Message>,
    pending: HashMap<u64, PendingWrite>,
    next_seq: u64,
    last_role: StateRole,
}

impl Worker {
    fn new(
        node: RaftNode,
        peers: HashMap<u64, String>,
        client_rx: Receiver<ClientRequest>,
        network_rx: Receiver<Message>,
    ) -> Self {
        let last_role = node.role();
        Self {
            node,
            peers,
            client_rx,
            network_rx,
            pending: HashMap::new(),
            next_seq: 0,
            last_role,
        }
    }

    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.client_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_client_request(req)? {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.network_rx) -> msg => {
                    match msg {
                        Ok(msg) => self.step_peer_message(msg),
                        Err(_) => break,
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.node.tick();
                self.expire_pending(Instant::now());
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.observe_role();
        }

        info!(node_id = self.node.id(), "raft worker stopped");
        Ok(())
    }

    /// Returns `false` once shutdown was requested.
    fn handle_client_request(&mut self, req: ClientRequest) -> Result<bool> {
        match req {
            ClientRequest::Write {
                op,
                deadline,
                respond_to,
            } => self.propose_write(op, deadline, respond_to),
            ClientRequest::Get { key, respond_to } => {
                let _ = respond_to.send(self.ensure_leader().map(|()| self.node.value_for(&key)));
            }
            ClientRequest::List { respond_to } => {
                let _ = respond_to.send(self.ensure_leader().map(|()| self.node.snapshot()));
            }
            ClientRequest::Status { respond_to } => {
                let _ = respond_to.send(Ok(NodeStatus {
                    node_id: self.node.id(),
                    role: self.node.role(),
                    leader_id: self.node.leader_id(),
                    term: self.node.term(),
                    store: self.node.snapshot(),
                    pending_writes: self.pending.len(),
                }));
            }
            ClientRequest::Campaign { respond_to } => {
                let previous = self.node.role();
                let result = self
                    .node
                    .campaign()
                    .map(|()| format!("campaign started from {previous:?}"))
                    .map_err(|err| StoreError::Rejected(format!("{err:#}")));
                if result.is_ok() {
                    info!(node_id = self.node.id(), ?previous, "campaign started");
                }
                let _ = respond_to.send(result);
            }
            ClientRequest::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn ensure_leader(&self) -> Result<(), StoreError> {
        if self.node.is_leader() {
            Ok(())
        } else {
            Err(StoreError::NotLeader {
                node_id: self.node.id(),
                leader_hint: self.node.leader_id(),
            })
        }
    }

    /// Proposes a write on the leader and parks the caller until it applies.
    fn propose_write(
        &mut self,
        op: WriteOp,
        deadline: Instant,
        respond_to: Sender<Result<AppliedChange, StoreError>>,
    ) {
        if let Err(err) = self.ensure_leader() {
            let _ = respond_to.send(Err(err));
            return;
        }

        self.next_seq += 1;
        let tag = ProposalTag {
            proposer: self.node.id(),
            seq: self.next_seq,
        };
        let payload = match op {
            WriteOp::Put { key, value } => CommandPayload::Put { tag, key, value },
            WriteOp::Delete { key } => CommandPayload::Delete { tag, key },
        };
        if payload.key().is_empty() {
            let _ = respond_to.send(Err(StoreError::Rejected("key must not be empty".into())));
            return;
        }

        match self.node.propose(&payload) {
            Ok(()) => {
                debug!(node_id = tag.proposer, seq = tag.seq, key = payload.key(), "proposed");
                self.pending.insert(
                    tag.seq,
                    PendingWrite {
                        respond_to,
                        deadline,
                    },
                );
            }
            Err(err) => {
                let _ = respond_to.send(Err(StoreError::Rejected(format!("{err:#}"))));
            }
        }
    }

    /// Drains Ready batches until Raft has nothing left to do.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for report in bundle.applied {
                self.notify_applied(report);
            }
        }
        Ok(())
    }

    /// A message Raft refuses (local type, unknown peer) is dropped, not fatal.
    fn step_peer_message(&mut self, msg: Message) {
        let (from, msg_type) = (msg.from, msg.msg_type);
        if let Err(err) = self.node.step(msg) {
            debug!(
                node_id = self.node.id(),
                from,
                ?msg_type,
                error = %err,
                "dropped peer message"
            );
        }
    }

    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            self.step_peer_message(msg);
            return Ok(());
        }
        let to = msg.to;
        let Some(addr) = self.peers.get(&to) else {
            warn!(node_id = self.node.id(), peer = to, "no address for peer, dropping message");
            return Ok(());
        };
        if let Err(err) = try_send(addr, &msg.encode_to_vec()) {
            debug!(node_id = self.node.id(), peer = to, %addr, error = %err, "send failed");
        }
        Ok(())
    }

    /// Answers the waiting caller if this node proposed the applied entry.
    fn notify_applied(&mut self, report: ApplyReport) {
        debug!(
            node_id = report.node_id,
            key = %report.key,
            change = ?report.change,
            index = report.index,
            term = report.term,
            "applied"
        );
        if report.tag.proposer != self.node.id() {
            return;
        }
        if let Some(pending) = self.pending.remove(&report.tag.seq) {
            let _ = pending.respond_to.send(Ok(report.change));
        }
    }

    /// Drops writes whose callers have already given up waiting.
    fn expire_pending(&mut self, now: Instant) {
        let before = self.pending.len();
        self.pending.retain(|_, pending| pending.deadline > now);
        let expired = before - self.pending.len();
        if expired > 0 {
            debug!(node_id = self.node.id(), expired, "expired pending writes");
        }
    }

    /// Logs role transitions. Stepping down fails every parked write, since
    /// this node can no longer report their commit.
    fn observe_role(&mut self) {
        let current = self.node.role();
        if current == self.last_role {
            return;
        }
        info!(
            node_id = self.node.id(),
            from = ?self.last_role,
            to = ?current,
            leader = self.node.leader_id(),
            term = self.node.term(),
            "role changed"
        );
        if self.last_role == StateRole::Leader && !self.pending.is_empty() {
            warn!(
                node_id = self.node.id(),
                pending = self.pending.len(),
                "leadership lost with writes in flight"
            );
            for (_, pending) in self.pending.drain() {
                let _ = pending
                    .respond_to
                    .send(Err(StoreError::Unavailable("leadership lost before commit".into())));
            }
        }
        self.last_role = current;
    }
}

/// Accepts peer connections; each one is read by a short-lived thread.
fn spawn_network_listener(listener: TcpListener, addr: String, tx: Sender<Message>) -> Result<()> {
    thread::Builder::new()
        .name(format!("raft-net-listener-{addr}"))
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, tx) {
                                debug!(error = %err, "peer connection error");
                            }
                        });
                    }
                    Err(err) => warn!(%addr, error = %err, "accept failed"),
                }
            }
        })
        .map(|_| ())
        .context("failed to spawn network listener")
}

/// Reads one frame: 4-byte big-endian length, then a protobuf `Message`.
fn handle_connection(mut stream: TcpStream, tx: Sender<Message>) -> io::Result<()> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    let msg =
        Message::decode(&buf[..]).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    tx.send(msg)
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))
}

/// One connection per message; Raft traffic here is heartbeats and small appends.
fn try_send(addr: &str, bytes: &[u8]) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr)?;
    let len = bytes.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(bytes)
}
