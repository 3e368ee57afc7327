//! Raft node driving an application state machine.
//!
//! [`RaftNode`] wraps tikv/raft's `RawNode` together with the log storage and a
//! [`StateMachine`]. It proposes commands and membership changes, applies
//! committed entries in log order, installs snapshots shipped by the leader
//! and captures new ones for compaction. It is single-threaded; the runtime
//! owns it on a dedicated worker thread.

use std::collections::BTreeMap;
use std::io;

use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfState, Config, Entry, EntryType, Message, RawNode, Snapshot,
};
use raft::storage::Storage;
use raft::{SnapshotStatus, StateRole};
use serde::{Deserialize, Serialize};
use slog::{Logger, o};
use tracing::{debug, info, warn};

use crate::config::RaftOptions;
use crate::error::{Error, Result};
use crate::fsm::{FsmSnapshot, StateMachine};
use crate::membership::{self, ClusterMember, Configuration, MembershipChange};
use crate::snapshot::BufferSink;
use crate::storage::SnapshotStorage;

const MAX_SIZE_PER_MSG: u64 = 1024 * 1024;

/// Raft requires a slog logger; logging happens through `tracing` instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Identifies a proposal so its apply result can be routed back to the
/// caller. Carried in the entry context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    pub node: u64,
    pub seq: u64,
}

impl RequestId {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.node.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf
    }

    fn decode(context: &[u8]) -> Option<Self> {
        let node = u64::from_be_bytes(context.get(..8)?.try_into().ok()?);
        let seq = u64::from_be_bytes(context.get(8..16)?.try_into().ok()?);
        Some(Self { node, seq })
    }
}

/// What a committed entry did.
#[derive(Debug)]
pub enum Applied<O> {
    Command(O),
    Membership(Result<()>),
}

/// Produced for every applied entry that carried data.
#[derive(Debug)]
pub struct ApplyReport<O> {
    pub index: u64,
    pub term: u64,
    pub request: Option<RequestId>,
    pub outcome: Applied<O>,
}

/// Messages to send and entries applied during one ready cycle.
pub struct ReadyBundle<O> {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport<O>>,
}

#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: u64,
    pub role: StateRole,
    pub leader_id: Option<u64>,
    pub term: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
    pub conf_change_pending: bool,
    pub configuration: Configuration,
}

/// Payload stored in `Snapshot::data`: the member address book next to the
/// state machine image.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SnapshotEnvelope {
    pub members: BTreeMap<u64, String>,
    pub state: Vec<u8>,
}

impl SnapshotEnvelope {
    fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(Error::decode)
    }
}

pub(crate) fn build_snapshot(
    index: u64,
    term: u64,
    conf_state: ConfState,
    envelope: &SnapshotEnvelope,
) -> Result<Snapshot> {
    let mut snapshot = Snapshot::default();
    snapshot.data = bincode::serialize(envelope)?.into();
    let meta = snapshot.mut_metadata();
    meta.index = index;
    meta.term = term;
    meta.set_conf_state(conf_state);
    Ok(snapshot)
}

/// Persists a state machine snapshot into memory and releases it.
fn persist_to_buffer<S: FsmSnapshot>(state: &mut S, id: String) -> Result<Vec<u8>> {
    let mut sink = BufferSink::new(id);
    let persisted = state.persist(&mut sink);
    state.release();
    persisted?;
    sink.into_bytes().ok_or_else(|| {
        Error::SnapshotIo(io::Error::new(
            io::ErrorKind::Other,
            "snapshot sink was not closed",
        ))
    })
}

/// A captured snapshot waiting to be persisted off the worker thread.
pub struct PendingSnapshot<S> {
    index: u64,
    term: u64,
    conf_state: ConfState,
    members: BTreeMap<u64, String>,
    state: S,
}

impl<S: FsmSnapshot> PendingSnapshot<S> {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn persist(mut self) -> Result<Snapshot> {
        let image = persist_to_buffer(&mut self.state, format!("{}-{}", self.term, self.index))?;
        let envelope = SnapshotEnvelope {
            members: self.members,
            state: image,
        };
        build_snapshot(self.index, self.term, self.conf_state, &envelope)
    }
}

pub struct RaftNode<M: StateMachine> {
    id: u64,
    raw: RawNode<SnapshotStorage>,
    storage: SnapshotStorage,
    fsm: M,
    members: BTreeMap<u64, String>,
    conf_state: ConfState,
    conf_index: u64,
    applied: u64,
    bootstrapped: bool,
}

impl<M: StateMachine> RaftNode<M> {
    /// Creates a node over `storage`.
    ///
    /// Storage holding state from an earlier run wins: the state machine
    /// and address book are restored from its image and committed entries
    /// after it are applied again by the first ready cycles. Otherwise, with
    /// `bootstrap`, the log starts from a snapshot that holds this node as
    /// the only voter at `address`; without it the node starts empty and
    /// waits for a leader to add it.
    pub fn new(
        id: u64,
        address: &str,
        bootstrap: bool,
        options: &RaftOptions,
        storage: SnapshotStorage,
        mut fsm: M,
    ) -> Result<Self> {
        let restarted = storage.has_state();
        let bootstrapped = bootstrap && !restarted;
        if bootstrapped {
            let mut state = fsm.snapshot()?;
            let image = persist_to_buffer(&mut state, "bootstrap".into())?;
            storage.install(membership::bootstrap_snapshot(id, address, image)?)?;
        } else if bootstrap {
            info!(node = id, "found existing raft state, not bootstrapping");
        }

        let mut members = BTreeMap::new();
        let mut conf_state = ConfState::default();
        let image = storage.image();
        if !image.data.is_empty() {
            // A restore failure here is fatal for this node's startup.
            let envelope = SnapshotEnvelope::decode(&image.data[..])?;
            fsm.restore(&mut envelope.state.as_slice())?;
            members = envelope.members;
            conf_state = image.get_metadata().get_conf_state().clone();
        }
        if restarted {
            info!(
                node = id,
                snapshot_index = image.get_metadata().index,
                members = members.len(),
                "restored from local state"
            );
        }

        let cfg = Config {
            id,
            election_tick: options.election_tick,
            heartbeat_tick: options.heartbeat_tick,
            max_inflight_msgs: options.max_inflight_msgs,
            max_size_per_msg: MAX_SIZE_PER_MSG,
            pre_vote: true,
            ..Default::default()
        };
        let raw = RawNode::new(&cfg, storage.clone(), &silent_logger())?;
        let applied = storage.snapshot_index();

        Ok(Self {
            id,
            raw,
            storage,
            fsm,
            members,
            conf_state,
            conf_index: applied,
            applied,
            bootstrapped,
        })
    }

    /// True if this node seeded a new cluster rather than starting empty or
    /// from persisted state.
    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign()?;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Raw leader id, 0 if unknown.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn known_leader(&self) -> Option<u64> {
        match self.leader_id() {
            0 => None,
            id => Some(id),
        }
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn applied_index(&self) -> u64 {
        self.applied
    }

    pub fn member_address(&self, id: u64) -> Option<&str> {
        self.members.get(&id).map(String::as_str)
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.role() != StateRole::Leader {
            return Err(Error::NotLeader {
                leader: self.known_leader(),
            });
        }
        Ok(())
    }

    /// Appends an encoded command to the log. Success means "appended", not
    /// "committed"; the result arrives through [`poll_ready`](Self::poll_ready).
    pub fn propose(&mut self, request: RequestId, data: Vec<u8>) -> Result<()> {
        self.ensure_leader()?;
        self.raw.propose(request.encode(), data)?;
        Ok(())
    }

    /// Proposes a single-step membership change.
    ///
    /// A non-zero `prior_index` must equal the index of the configuration
    /// the caller last read.
    pub fn propose_membership(
        &mut self,
        request: RequestId,
        change: &MembershipChange,
        prior_index: u64,
    ) -> Result<()> {
        self.ensure_leader()?;
        if self.raw.raft.has_pending_conf() {
            return Err(Error::ConfChangeInProgress);
        }
        if prior_index != 0 && prior_index != self.conf_index {
            return Err(Error::ConfigurationChanged {
                expected: prior_index,
                current: self.conf_index,
            });
        }

        let mut cc = ConfChange::default();
        match change {
            MembershipChange::AddVoter { id, address } => {
                cc.set_change_type(ConfChangeType::AddNode);
                cc.node_id = *id;
                cc.context = address.clone().into_bytes().into();
            }
            MembershipChange::Remove { id } => {
                cc.set_change_type(ConfChangeType::RemoveNode);
                cc.node_id = *id;
            }
        }
        self.raw.propose_conf_change(request.encode(), cc)?;
        Ok(())
    }

    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg)?;
        Ok(())
    }

    pub fn report_snapshot(&mut self, to: u64, status: SnapshotStatus) {
        self.raw.report_snapshot(to, status);
    }

    pub fn report_unreachable(&mut self, to: u64) {
        self.raw.report_unreachable(to);
    }

    /// Runs one ready cycle: install any incoming snapshot, persist entries
    /// and hard state, apply committed entries and collect outbound messages.
    ///
    /// An error here means local state can no longer be trusted; the caller
    /// should stop the node.
    ///
    /// # Why this order?
    ///
    /// - Snapshot before entries: installing one clears the log
    /// - Entries and hard state are stored before the persisted messages go
    ///   out, so a vote or append is never acknowledged before it is durable
    /// - Leader messages from `take_messages` may go out first, since the
    ///   leader's own append is not needed for it to replicate
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle<M::Output>>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = Vec::new();

        // A snapshot resets the log, so it goes in before the new entries.
        if !ready.snapshot().is_empty() {
            self.install_snapshot(ready.snapshot().clone())?;
        }
        if !ready.entries().is_empty() {
            self.storage.append(ready.entries())?;
        }
        if let Some(hard_state) = ready.hs() {
            self.storage.set_hardstate(hard_state.clone())?;
        }

        outbound.extend(ready.take_messages());
        applied.extend(self.apply_entries(ready.take_committed_entries())?);
        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);
        if let Some(commit) = light_ready.commit_index() {
            self.storage.set_commit(commit)?;
        }
        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);
        outbound.extend(light_ready.take_messages());

        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
        }))
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<ApplyReport<M::Output>>> {
        let mut reports = Vec::new();
        for entry in entries {
            self.applied = entry.index;
            // New leaders append an empty entry.
            if entry.data.is_empty() {
                continue;
            }
            let outcome = match entry.entry_type() {
                EntryType::EntryNormal => Applied::Command(self.fsm.apply(&entry.data)),
                EntryType::EntryConfChange => Applied::Membership(self.apply_conf_change(&entry)),
                EntryType::EntryConfChangeV2 => {
                    warn!(node = self.id, index = entry.index, "ignoring joint configuration change");
                    continue;
                }
            };
            reports.push(ApplyReport {
                index: entry.index,
                term: entry.term,
                request: RequestId::decode(&entry.context),
                outcome,
            });
        }
        Ok(reports)
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<()> {
        let cc = ConfChange::decode(&entry.data[..]).map_err(Error::decode)?;
        let cs = self.raw.apply_conf_change(&cc)?;
        self.storage.set_conf_state(cs.clone());
        self.conf_state = cs;
        self.conf_index = entry.index;

        match cc.change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                let address = String::from_utf8_lossy(&cc.context).into_owned();
                info!(node = self.id, member = cc.node_id, %address, index = entry.index, "member added");
                self.members.insert(cc.node_id, address);
            }
            ConfChangeType::RemoveNode => {
                info!(node = self.id, member = cc.node_id, index = entry.index, "member removed");
                self.members.remove(&cc.node_id);
            }
        }
        Ok(())
    }

    /// Restores the state machine from a leader's snapshot. A failure leaves
    /// the node unusable and is returned as fatal.
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata().clone();
        let envelope = SnapshotEnvelope::decode(&snapshot.data[..])?;
        self.fsm.restore(&mut envelope.state.as_slice())?;
        self.storage.install(snapshot)?;

        self.conf_state = meta.get_conf_state().clone();
        self.members = envelope.members;
        self.applied = meta.index;
        self.conf_index = meta.index;
        info!(
            node = self.id,
            index = meta.index,
            term = meta.term,
            members = self.members.len(),
            "installed snapshot"
        );
        Ok(())
    }

    /// Entries applied since the last compaction.
    pub fn entries_since_snapshot(&self) -> u64 {
        self.applied.saturating_sub(self.storage.snapshot_index())
    }

    pub fn take_snapshot_request(&self) -> bool {
        self.storage.take_snapshot_request()
    }

    /// Copies the state machine at the applied index. Returns `None` when
    /// the stored image is already current.
    pub fn capture_snapshot(&mut self) -> Result<Option<PendingSnapshot<M::Snapshot>>> {
        if self.applied <= self.storage.snapshot_index() {
            return Ok(None);
        }
        let term = self.storage.term(self.applied)?;
        let state = self.fsm.snapshot()?;
        debug!(node = self.id, index = self.applied, "captured snapshot");
        Ok(Some(PendingSnapshot {
            index: self.applied,
            term,
            conf_state: self.conf_state.clone(),
            members: self.members.clone(),
            state,
        }))
    }

    /// Keeps `snapshot` as the current image and compacts the log up to it.
    pub fn compact(&mut self, snapshot: Snapshot) -> Result<bool> {
        Ok(self.storage.compact(snapshot)?)
    }

    pub fn snapshot_index(&self) -> u64 {
        self.storage.snapshot_index()
    }

    pub fn configuration(&self) -> Configuration {
        Configuration {
            index: self.conf_index,
            members: self
                .members
                .iter()
                .map(|(&id, address)| ClusterMember {
                    id,
                    address: address.clone(),
                })
                .collect(),
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            role: self.role(),
            leader_id: self.known_leader(),
            term: self.term(),
            commit_index: self.raw.raft.raft_log.committed,
            applied_index: self.applied,
            last_log_index: self.raw.raft.raft_log.last_index(),
            snapshot_index: self.storage.snapshot_index(),
            conf_change_pending: self.raw.raft.has_pending_conf(),
            configuration: self.configuration(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use raft::prelude::MessageType;
    use tempfile::TempDir;

    use super::*;
    use crate::command::{ApplyOutcome, Command};
    use crate::message::Message as QueueMessage;
    use crate::queue::Queue;
    use crate::store::QueueStateMachine;

    type Node = RaftNode<QueueStateMachine<String>>;

    /// Routes messages between nodes in memory, standing in for the runtime.
    struct TestCluster {
        nodes: BTreeMap<u64, Node>,
        queues: BTreeMap<u64, Arc<Queue<String>>>,
        reports: Vec<(u64, ApplyReport<ApplyOutcome<String>>)>,
        seq: u64,
    }

    impl TestCluster {
        fn empty() -> Self {
            Self {
                nodes: BTreeMap::new(),
                queues: BTreeMap::new(),
                reports: Vec::new(),
                seq: 0,
            }
        }

        /// Node 1 bootstraps and becomes leader.
        fn bootstrap() -> Result<Self> {
            let mut cluster = Self::empty();
            cluster.start_node(1, true)?;
            cluster.node_mut(1).campaign()?;
            cluster.stabilize(10)?;
            Ok(cluster)
        }

        fn start_node(&mut self, id: u64, bootstrap: bool) -> Result<()> {
            self.start_node_with(id, bootstrap, SnapshotStorage::new())
        }

        fn start_node_with(&mut self, id: u64, bootstrap: bool, storage: SnapshotStorage) -> Result<()> {
            let queue = Arc::new(Queue::new());
            let fsm = QueueStateMachine::new(Arc::clone(&queue));
            let options = RaftOptions::default();
            let node = RaftNode::new(id, &addr(id), bootstrap, &options, storage, fsm)?;
            self.nodes.insert(id, node);
            self.queues.insert(id, queue);
            Ok(())
        }

        fn node(&self, id: u64) -> &Node {
            self.nodes.get(&id).expect("node not found")
        }

        fn node_mut(&mut self, id: u64) -> &mut Node {
            self.nodes.get_mut(&id).expect("node not found")
        }

        fn queue(&self, id: u64) -> Vec<String> {
            self.queues[&id]
                .messages()
                .into_iter()
                .map(QueueMessage::into_inner)
                .collect()
        }

        fn next_request(&mut self, node: u64) -> RequestId {
            self.seq += 1;
            RequestId {
                node,
                seq: self.seq,
            }
        }

        fn send(&mut self, node: u64, data: &str) -> Result<RequestId> {
            let request = self.next_request(node);
            let bytes = Command::Send(QueueMessage::new(data.to_string())).encode()?;
            self.node_mut(node).propose(request, bytes)?;
            Ok(request)
        }

        fn add_voter(&mut self, id: u64) -> Result<()> {
            self.start_node(id, false)?;
            let request = self.next_request(1);
            let change = MembershipChange::AddVoter {
                id,
                address: addr(id),
            };
            self.node_mut(1).propose_membership(request, &change, 0)
        }

        /// Mirrors the worker's compaction: capture, persist, compact.
        fn compact(&mut self, id: u64) -> Result<()> {
            if let Some(pending) = self.node_mut(id).capture_snapshot()? {
                let snapshot = pending.persist()?;
                self.node_mut(id).compact(snapshot)?;
            }
            Ok(())
        }

        fn deliver_messages(&mut self) -> Result<usize> {
            let mut total = 0;
            loop {
                let mut messages = Vec::new();
                let ids: Vec<u64> = self.nodes.keys().copied().collect();
                for id in ids {
                    if let Some(bundle) = self.node_mut(id).poll_ready()? {
                        messages.extend(bundle.messages);
                        self.reports
                            .extend(bundle.applied.into_iter().map(|report| (id, report)));
                    }
                    if self.node(id).take_snapshot_request() {
                        self.compact(id)?;
                    }
                }
                if messages.is_empty() {
                    break;
                }
                total += messages.len();
                for msg in messages {
                    if let Some(node) = self.nodes.get_mut(&msg.to) {
                        node.step(msg)?;
                    }
                }
            }
            Ok(total)
        }

        /// Ticks every node `rounds` times, delivering messages in between.
        /// Quiet rounds still tick so heartbeats pick up lagging members.
        fn stabilize(&mut self, rounds: usize) -> Result<()> {
            for _ in 0..rounds {
                for node in self.nodes.values_mut() {
                    node.tick();
                }
                self.deliver_messages()?;
            }
            Ok(())
        }
    }

    fn addr(id: u64) -> String {
        format!("127.0.0.1:{}", 7000 + id)
    }

    #[test]
    fn bootstrap_node_leads_a_single_member_cluster() -> Result<()> {
        let cluster = TestCluster::bootstrap()?;
        let node = cluster.node(1);
        assert_eq!(node.role(), StateRole::Leader);

        let config = node.configuration();
        assert_eq!(
            config.members,
            vec![ClusterMember {
                id: 1,
                address: addr(1)
            }]
        );
        Ok(())
    }

    #[test]
    fn results_are_reported_to_the_proposer_only() -> Result<()> {
        let mut cluster = TestCluster::bootstrap()?;
        cluster.add_voter(2)?;
        cluster.stabilize(20)?;

        let request = cluster.send(1, "a")?;
        cluster.stabilize(10)?;

        let tagged: Vec<u64> = cluster
            .reports
            .iter()
            .filter(|(_, report)| report.request == Some(request))
            .map(|(node, _)| *node)
            .collect();
        // Both replicas apply the entry with the same context; the runtime
        // routes by request node, so only node 1 answers a caller.
        assert_eq!(tagged, vec![1, 2]);
        assert!(cluster
            .reports
            .iter()
            .all(|(_, report)| report.request.map_or(true, |r| r.node == 1)));
        Ok(())
    }

    #[test]
    fn commands_replicate_to_a_joined_member() -> Result<()> {
        let mut cluster = TestCluster::bootstrap()?;
        cluster.add_voter(2)?;
        cluster.stabilize(20)?;
        assert_eq!(cluster.node(1).configuration().members.len(), 2);
        assert_eq!(cluster.node(2).configuration().members.len(), 2);

        cluster.send(1, "a")?;
        cluster.send(1, "b")?;
        cluster.stabilize(10)?;
        assert_eq!(cluster.queue(1), vec!["a", "b"]);
        assert_eq!(cluster.queue(2), vec!["a", "b"]);

        let err = cluster.send(2, "c").unwrap_err();
        assert!(matches!(err, Error::NotLeader { leader: Some(1) }));
        Ok(())
    }

    #[test]
    fn lagging_member_catches_up_from_a_compacted_snapshot() -> Result<()> {
        let mut cluster = TestCluster::bootstrap()?;
        for data in ["x", "y", "z"] {
            cluster.send(1, data)?;
        }
        cluster.stabilize(5)?;
        cluster.compact(1)?;
        let compacted_at = cluster.node(1).snapshot_index();
        assert!(compacted_at >= 4);

        cluster.add_voter(3)?;
        cluster.stabilize(30)?;

        assert_eq!(cluster.queue(3), vec!["x", "y", "z"]);
        assert!(cluster.node(3).snapshot_index() > compacted_at);
        assert_eq!(cluster.node(3).member_address(1), Some(addr(1).as_str()));
        assert_eq!(cluster.node(3).member_address(3), Some(addr(3).as_str()));
        Ok(())
    }

    #[test]
    fn membership_changes_are_serialized() -> Result<()> {
        let mut cluster = TestCluster::bootstrap()?;
        cluster.add_voter(2)?;

        let request = cluster.next_request(1);
        let change = MembershipChange::AddVoter {
            id: 3,
            address: addr(3),
        };
        let err = cluster
            .node_mut(1)
            .propose_membership(request, &change, 0)
            .unwrap_err();
        assert!(matches!(err, Error::ConfChangeInProgress));

        cluster.stabilize(20)?;
        let stale = cluster.node(1).configuration().index - 1;
        let err = cluster
            .node_mut(1)
            .propose_membership(request, &change, stale)
            .unwrap_err();
        assert!(matches!(err, Error::ConfigurationChanged { .. }));
        Ok(())
    }

    #[test]
    fn node_restarts_from_its_data_directory() -> Result<()> {
        let temp_dir = TempDir::new().expect("create temp dir");
        let mut cluster = TestCluster::empty();
        cluster.start_node_with(1, true, SnapshotStorage::open(temp_dir.path())?)?;
        cluster.node_mut(1).campaign()?;
        cluster.stabilize(5)?;
        for data in ["a", "b"] {
            cluster.send(1, data)?;
        }
        cluster.stabilize(5)?;
        cluster.compact(1)?;
        cluster.send(1, "c")?;
        cluster.stabilize(5)?;
        let compacted_at = cluster.node(1).snapshot_index();
        let applied = cluster.node(1).applied_index();
        drop(cluster);

        let mut cluster = TestCluster::empty();
        cluster.start_node_with(1, true, SnapshotStorage::open(temp_dir.path())?)?;
        let node = cluster.node(1);
        assert!(!node.bootstrapped());
        assert_eq!(node.snapshot_index(), compacted_at);
        assert_eq!(node.member_address(1), Some(addr(1).as_str()));
        // The image holds "a" and "b"; "c" comes back from the log.
        assert_eq!(cluster.queue(1), vec!["a", "b"]);

        cluster.stabilize(30)?;
        assert_eq!(cluster.node(1).role(), StateRole::Leader);
        assert!(cluster.node(1).applied_index() > applied);
        assert_eq!(cluster.queue(1), vec!["a", "b", "c"]);
        Ok(())
    }

    #[test]
    fn failed_snapshot_install_is_fatal() -> Result<()> {
        let mut cluster = TestCluster::empty();
        cluster.start_node(2, false)?;

        let mut snapshot = Snapshot::default();
        snapshot.data = b"not an envelope".to_vec().into();
        let meta = snapshot.mut_metadata();
        meta.index = 5;
        meta.term = 1;
        meta.set_conf_state(ConfState::from((vec![1, 2], vec![])));
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgSnapshot);
        msg.from = 1;
        msg.to = 2;
        msg.term = 1;
        msg.set_snapshot(snapshot);

        let node = cluster.node_mut(2);
        node.step(msg)?;
        assert!(node.poll_ready().is_err());
        assert_eq!(node.applied_index(), 0);
        assert!(cluster.queue(2).is_empty());
        Ok(())
    }

    #[test]
    fn request_ids_round_trip_through_entry_context() {
        let id = RequestId { node: 3, seq: 42 };
        assert_eq!(RequestId::decode(&id.encode()), Some(id));
        assert_eq!(RequestId::decode(&[]), None);
    }
}
