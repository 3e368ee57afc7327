//! Worker runtime for a raft node.
//!
//! - **Worker thread**: owns the [`RaftNode`], runs the event loop, serves
//!   requests from [`NodeHandle`]s
//! - **Listener thread**: accepts peer connections and forwards messages
//! - **Snapshot threads**: persist a captured snapshot off the apply path
//!
//! Everything talks to the worker over crossbeam channels, so raft state is
//! only ever touched from one thread.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use raft::prelude::{Message, MessageType, Snapshot};
use raft::{SnapshotStatus, StateRole};
use tracing::{debug, error, info, warn};

use crate::config::{NodeConfig, RaftOptions};
use crate::error::{Error, Result};
use crate::fsm::StateMachine;
use crate::membership::{ClusterControl, Configuration, MembershipChange};
use crate::node::{Applied, ApplyReport, NodeStatus, RaftNode, RequestId};
use crate::storage::SnapshotStorage;
use crate::transport::{self, Envelope};

/// Cheap, cloneable handle to a running node.
///
/// `O` is the state machine's apply output, returned by [`submit`](Self::submit).
///
/// # Why block on a reply channel?
///
/// - **Result per caller**: each request carries its own `bounded(1)` sender
/// - **Timeouts stay local**: a caller that gives up drops its receiver and
///   the worker's late reply goes nowhere
pub struct NodeHandle<O> {
    request_tx: Sender<ClientRequest<O>>,
}

impl<O> Clone for NodeHandle<O> {
    fn clone(&self) -> Self {
        Self {
            request_tx: self.request_tx.clone(),
        }
    }
}

impl<O: Send + 'static> NodeHandle<O> {
    fn request<R>(&self, build: impl FnOnce(Sender<R>) -> ClientRequest<O>) -> Result<Receiver<R>> {
        let (tx, rx) = bounded(1);
        self.request_tx.send(build(tx)).map_err(|_| Error::Stopped)?;
        Ok(rx)
    }

    /// Appends `data` to the log and blocks until it is applied locally.
    ///
    /// On [`Error::Timeout`] or [`Error::LeadershipLost`] the entry may still
    /// commit later.
    pub fn submit(&self, data: Vec<u8>, timeout: Duration) -> Result<O> {
        let rx = self.request(|respond_to| ClientRequest::Submit { data, respond_to })?;
        wait_for_commit(&rx, timeout)?
    }

    pub fn change_membership(
        &self,
        change: MembershipChange,
        prior_index: u64,
        timeout: Duration,
    ) -> Result<()> {
        let rx = self.request(|respond_to| ClientRequest::ChangeMembership {
            change,
            prior_index,
            respond_to,
        })?;
        wait_for_commit(&rx, timeout)?
    }

    /// Current role and the leader this node knows of.
    pub fn role(&self) -> Result<(StateRole, Option<u64>)> {
        let rx = self.request(|respond_to| ClientRequest::Role { respond_to })?;
        rx.recv().map_err(|_| Error::Stopped)
    }

    pub fn status(&self) -> Result<NodeStatus> {
        let rx = self.request(|respond_to| ClientRequest::Status { respond_to })?;
        rx.recv().map_err(|_| Error::Stopped)
    }

    pub fn configuration(&self) -> Result<Configuration> {
        let rx = self.request(|respond_to| ClientRequest::Configuration { respond_to })?;
        rx.recv().map_err(|_| Error::Stopped)
    }

    /// Captures and persists a snapshot, compacting the log. Returns the
    /// index of the newest snapshot once it is in place.
    pub fn snapshot(&self, timeout: Duration) -> Result<u64> {
        let rx = self.request(|respond_to| ClientRequest::Snapshot { respond_to })?;
        wait_for_commit(&rx, timeout)?
    }

}

fn wait_for_commit<R>(rx: &Receiver<R>, timeout: Duration) -> Result<R> {
    match rx.recv_timeout(timeout) {
        Ok(value) => Ok(value),
        Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
        Err(RecvTimeoutError::Disconnected) => Err(Error::Stopped),
    }
}

impl<O: Send + 'static> ClusterControl for NodeHandle<O> {
    fn configuration(&self) -> Result<Configuration> {
        NodeHandle::configuration(self)
    }

    fn add_voter(&self, id: u64, address: &str, prior_index: u64, timeout: Duration) -> Result<()> {
        let change = MembershipChange::AddVoter {
            id,
            address: address.to_string(),
        };
        self.change_membership(change, prior_index, timeout)
    }

    fn remove_member(&self, id: u64, prior_index: u64, timeout: Duration) -> Result<()> {
        self.change_membership(MembershipChange::Remove { id }, prior_index, timeout)
    }
}

enum ClientRequest<O> {
    Submit {
        data: Vec<u8>,
        respond_to: Sender<Result<O>>,
    },
    ChangeMembership {
        change: MembershipChange,
        prior_index: u64,
        respond_to: Sender<Result<()>>,
    },
    Role {
        respond_to: Sender<(StateRole, Option<u64>)>,
    },
    Status {
        respond_to: Sender<NodeStatus>,
    },
    Configuration {
        respond_to: Sender<Configuration>,
    },
    Snapshot {
        respond_to: Sender<Result<u64>>,
    },
    Shutdown,
}

/// A proposal waiting for its entry to be applied.
enum Pending<O> {
    Command(Sender<Result<O>>),
    Membership(Sender<Result<()>>),
}

impl<O> Pending<O> {
    fn fail(self, err: Error) {
        match self {
            Pending::Command(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::Membership(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// A running node: its handle plus the threads behind it.
///
/// Dropping the runtime stops the node as well.
pub struct NodeRuntime<O> {
    handle: NodeHandle<O>,
    local_addr: SocketAddr,
    advertise_addr: String,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

impl<O> NodeRuntime<O> {
    pub fn handle(&self) -> NodeHandle<O> {
        self.handle.clone()
    }

    /// Address the raft listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address peers are told to use.
    pub fn advertise_addr(&self) -> &str {
        &self.advertise_addr
    }

    /// Stops the worker and the listener and waits for both to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.handle.request_tx.send(ClientRequest::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(addr = %self.local_addr, "raft worker panicked");
            }
        }
        if let Some(listener) = self.listener.take() {
            self.stop.store(true, Ordering::Release);
            transport::wake_listener(self.local_addr);
            let _ = listener.join();
        }
    }
}

impl<O> Drop for NodeRuntime<O> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Binds the raft listener, builds the node and starts its threads.
///
/// With a data directory the node resumes from whatever state it persisted
/// there. A node that bootstraps a new cluster campaigns right away and,
/// being the only voter, leads as soon as the worker runs.
pub fn spawn_node<M: StateMachine>(config: NodeConfig, fsm: M) -> Result<NodeRuntime<M::Output>> {
    config.validate()?;
    let listener = TcpListener::bind(&config.raft_addr)?;
    let local_addr = listener.local_addr()?;
    let advertise_addr = config
        .advertise_addr
        .clone()
        .unwrap_or_else(|| local_addr.to_string());

    let storage = match &config.data_dir {
        Some(dir) => SnapshotStorage::open(dir)?,
        None => SnapshotStorage::new(),
    };
    let node = RaftNode::new(
        config.id,
        &advertise_addr,
        config.bootstrap,
        &config.options,
        storage,
        fsm,
    )?;
    let (client_tx, client_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();
    let stop = Arc::new(AtomicBool::new(false));

    let listener = transport::spawn_listener(listener, network_tx, Arc::clone(&stop))?;

    let id = config.id;
    let bootstrapped = node.bootstrapped();
    let mut worker = Worker::new(node, advertise_addr.clone(), config.options, client_rx, network_rx);
    let spawned = thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = worker.run() {
                error!(node = id, error = %err, "raft worker crashed");
            }
        });
    let worker = match spawned {
        Ok(worker) => worker,
        Err(err) => {
            stop.store(true, Ordering::Release);
            transport::wake_listener(local_addr);
            let _ = listener.join();
            return Err(err.into());
        }
    };

    info!(node = id, addr = %local_addr, advertise = %advertise_addr, bootstrapped, "raft node started");
    Ok(NodeRuntime {
        handle: NodeHandle {
            request_tx: client_tx,
        },
        local_addr,
        advertise_addr,
        stop,
        worker: Some(worker),
        listener: Some(listener),
    })
}

/// Nanoseconds since the epoch, so each run of a node issues fresh request ids.
fn initial_seq() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos() as u64)
}

/// Runs the raft event loop.
///
/// Waits on client requests, peer messages and finished snapshots, ticks
/// the node at a fixed interval, and drains ready state after every event.
struct Worker<M: StateMachine> {
    node: RaftNode<M>,
    advertise_addr: String,
    options: RaftOptions,
    client_rx: Receiver<ClientRequest<M::Output>>,
    network_rx: Receiver<Envelope>,
    snapshot_tx: Sender<Result<Snapshot>>,
    snapshot_rx: Receiver<Result<Snapshot>>,
    /// Peer addresses learned from incoming frames, for nodes not (yet) in
    /// the configuration.
    learned: HashMap<u64, String>,
    pending: HashMap<RequestId, Pending<M::Output>>,
    next_seq: u64,
    last_role: StateRole,
    snapshot_in_flight: bool,
    snapshot_waiters: Vec<Sender<Result<u64>>>,
}

impl<M: StateMachine> Worker<M> {
    fn new(
        node: RaftNode<M>,
        advertise_addr: String,
        options: RaftOptions,
        client_rx: Receiver<ClientRequest<M::Output>>,
        network_rx: Receiver<Envelope>,
    ) -> Self {
        let (snapshot_tx, snapshot_rx) = unbounded();
        let last_role = node.role();
        Self {
            node,
            advertise_addr,
            options,
            client_rx,
            network_rx,
            snapshot_tx,
            snapshot_rx,
            learned: HashMap::new(),
            pending: HashMap::new(),
            next_seq: initial_seq(),
            last_role,
            snapshot_in_flight: false,
            snapshot_waiters: Vec::new(),
        }
    }

    fn run(&mut self) -> Result<()> {
        if self.node.bootstrapped() {
            self.node.campaign()?;
        }

        let tick_interval = self.options.tick_interval;
        let mut last_tick = Instant::now();
        loop {
            let timeout = tick_interval
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.client_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_client_request(req) {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.network_rx) -> envelope => {
                    match envelope {
                        Ok(envelope) => self.handle_envelope(envelope),
                        Err(_) => break,
                    }
                }
                recv(self.snapshot_rx) -> persisted => {
                    if let Ok(persisted) = persisted {
                        self.finish_snapshot(persisted)?;
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= tick_interval {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.track_role();
            self.maybe_snapshot();
        }

        info!(node = self.node.id(), "raft worker stopped");
        Ok(())
    }

    fn next_request(&mut self) -> RequestId {
        self.next_seq += 1;
        RequestId {
            node: self.node.id(),
            seq: self.next_seq,
        }
    }

    /// Returns `false` once shutdown is requested.
    fn handle_client_request(&mut self, req: ClientRequest<M::Output>) -> bool {
        match req {
            ClientRequest::Submit { data, respond_to } => {
                let request = self.next_request();
                match self.node.propose(request, data) {
                    Ok(()) => {
                        self.pending.insert(request, Pending::Command(respond_to));
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            ClientRequest::ChangeMembership {
                change,
                prior_index,
                respond_to,
            } => {
                let request = self.next_request();
                match self.node.propose_membership(request, &change, prior_index) {
                    Ok(()) => {
                        info!(node = self.node.id(), ?change, "proposed membership change");
                        self.pending.insert(request, Pending::Membership(respond_to));
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            ClientRequest::Role { respond_to } => {
                let _ = respond_to.send((self.node.role(), self.node.known_leader()));
            }
            ClientRequest::Status { respond_to } => {
                let _ = respond_to.send(self.node.status());
            }
            ClientRequest::Configuration { respond_to } => {
                let _ = respond_to.send(self.node.configuration());
            }
            ClientRequest::Snapshot { respond_to } => {
                self.snapshot_waiters.push(respond_to);
                self.start_snapshot();
            }
            ClientRequest::Shutdown => return false,
        }
        true
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        let Envelope { from_addr, message } = envelope;
        let from = message.from;
        if from != 0 && !from_addr.is_empty() {
            self.learned.insert(from, from_addr);
        }
        // Stale or misaddressed messages are normal around membership changes.
        if let Err(err) = self.node.step(message) {
            debug!(node = self.node.id(), from, error = %err, "dropped raft message");
        }
    }

    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for report in bundle.applied {
                self.notify(report);
            }
        }
        Ok(())
    }

    fn peer_address(&self, id: u64) -> Option<String> {
        self.node
            .member_address(id)
            .map(str::to_owned)
            .or_else(|| self.learned.get(&id).cloned())
    }

    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            return self.node.step(msg);
        }

        let to = msg.to;
        let is_snapshot = msg.msg_type() == MessageType::MsgSnapshot;
        let delivered = match self.peer_address(to) {
            Some(addr) => {
                let frame = transport::encode_frame(&self.advertise_addr, &msg);
                match transport::send_frame(&addr, &frame) {
                    Ok(()) => true,
                    Err(err) if err.kind() == io::ErrorKind::InvalidInput => {
                        // Retried by raft, so a snapshot that never fits keeps warning.
                        warn!(
                            node = self.node.id(),
                            to,
                            snapshot = is_snapshot,
                            bytes = frame.len(),
                            limit = transport::MAX_FRAME_LEN,
                            "message too large for the transport, dropping"
                        );
                        false
                    }
                    Err(err) => {
                        debug!(node = self.node.id(), to, %addr, error = %err, "send failed");
                        false
                    }
                }
            }
            None => {
                warn!(node = self.node.id(), to, "no address for peer, dropping message");
                false
            }
        };

        if !delivered {
            self.node.report_unreachable(to);
        }
        if is_snapshot {
            let status = if delivered {
                SnapshotStatus::Finish
            } else {
                SnapshotStatus::Failure
            };
            self.node.report_snapshot(to, status);
        }
        Ok(())
    }

    /// Hands an apply result to the caller waiting on it. Entries proposed
    /// elsewhere, or whose caller already gave up, are only logged.
    ///
    /// # Why a request id in the entry context?
    ///
    /// Two sends of equal messages are indistinguishable by payload. The
    /// context tags each entry with the proposing node and a sequence number,
    /// so the match is exact. Sequences start from the wall clock, so entries
    /// replayed from an earlier run never match a new proposal.
    fn notify(&mut self, report: ApplyReport<M::Output>) {
        debug!(
            node = self.node.id(),
            index = report.index,
            term = report.term,
            "applied entry"
        );
        let Some(request) = report.request else {
            return;
        };
        if request.node != self.node.id() {
            return;
        }
        let Some(pending) = self.pending.remove(&request) else {
            return;
        };
        match (pending, report.outcome) {
            (Pending::Command(tx), Applied::Command(output)) => {
                let _ = tx.send(Ok(output));
            }
            (Pending::Membership(tx), Applied::Membership(result)) => {
                let _ = tx.send(result);
            }
            (pending, _) => pending.fail(Error::Decode(format!(
                "entry {} does not match its proposal",
                report.index
            ))),
        }
    }

    fn track_role(&mut self) {
        let current = self.node.role();
        if current == self.last_role {
            return;
        }
        info!(
            node = self.node.id(),
            from = ?self.last_role,
            to = ?current,
            leader = self.node.leader_id(),
            term = self.node.term(),
            "role changed"
        );
        if self.last_role == StateRole::Leader && !self.pending.is_empty() {
            warn!(
                node = self.node.id(),
                dropped = self.pending.len(),
                "lost leadership with proposals in flight"
            );
            for (_, pending) in self.pending.drain() {
                pending.fail(Error::LeadershipLost);
            }
        }
        self.last_role = current;
    }

    fn maybe_snapshot(&mut self) {
        if self.snapshot_in_flight {
            return;
        }
        let requested = self.node.take_snapshot_request();
        if requested || self.node.entries_since_snapshot() >= self.options.snapshot_threshold {
            self.start_snapshot();
        }
    }

    /// Captures the state machine here and persists it on a separate thread.
    fn start_snapshot(&mut self) {
        if self.snapshot_in_flight {
            return;
        }
        let pending = match self.node.capture_snapshot() {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                let index = self.node.snapshot_index();
                self.answer_snapshot_waiters(Ok(index));
                return;
            }
            Err(err) => {
                warn!(node = self.node.id(), error = %err, "snapshot capture failed");
                self.answer_snapshot_waiters(Err(err));
                return;
            }
        };

        let index = pending.index();
        let tx = self.snapshot_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("raft-snapshot-{}", self.node.id()))
            .spawn(move || {
                let _ = tx.send(pending.persist());
            });
        match spawned {
            Ok(_) => {
                debug!(node = self.node.id(), index, "persisting snapshot");
                self.snapshot_in_flight = true;
            }
            Err(err) => {
                warn!(node = self.node.id(), error = %err, "failed to spawn snapshot thread");
                self.answer_snapshot_waiters(Err(Error::Io(err)));
            }
        }
    }

    fn finish_snapshot(&mut self, persisted: Result<Snapshot>) -> Result<()> {
        self.snapshot_in_flight = false;
        match persisted {
            Ok(snapshot) => {
                let index = snapshot.get_metadata().index;
                if self.node.compact(snapshot)? {
                    info!(node = self.node.id(), index, "log compacted");
                }
                let current = self.node.snapshot_index();
                self.answer_snapshot_waiters(Ok(current));
            }
            Err(err) => {
                warn!(node = self.node.id(), error = %err, "snapshot persist failed");
                self.answer_snapshot_waiters(Err(err));
            }
        }
        Ok(())
    }

    fn answer_snapshot_waiters(&mut self, result: Result<u64>) {
        let waiters = std::mem::take(&mut self.snapshot_waiters);
        match result {
            Ok(index) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(index));
                }
            }
            Err(err) => {
                let reason = err.to_string();
                for waiter in waiters {
                    let _ = waiter.send(Err(Error::Snapshot(reason.clone())));
                }
            }
        }
    }
}
