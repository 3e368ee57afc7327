//! The replicated queue.
//!
//! [`Store`] is what clients talk to: `send` and `receive` are leader-only
//! and go through the log. [`QueueStateMachine`] is what the log drives: it
//! applies committed commands to the local [`Queue`] on every node.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use raft::StateRole;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::command::{ApplyOutcome, Command};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::fsm::StateMachine;
use crate::membership::{Configuration, Membership};
use crate::message::Message;
use crate::node::NodeStatus;
use crate::queue::Queue;
use crate::runtime::{NodeHandle, NodeRuntime, spawn_node};
use crate::snapshot::{QueueSnapshot, decode_image};

/// Bounds a queue element type must meet to be replicated.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Applies queue commands in log order.
pub struct QueueStateMachine<T> {
    queue: Arc<Queue<T>>,
}

impl<T> QueueStateMachine<T> {
    pub fn new(queue: Arc<Queue<T>>) -> Self {
        Self { queue }
    }
}

impl<T: Payload> StateMachine for QueueStateMachine<T> {
    type Output = ApplyOutcome<T>;
    type Snapshot = QueueSnapshot<T>;

    fn apply(&mut self, entry: &[u8]) -> ApplyOutcome<T> {
        let command = match Command::<T>::decode(entry) {
            Ok(command) => command,
            Err(err) => {
                warn!(error = %err, "skipping entry that is not a queue command");
                return ApplyOutcome::Error(err);
            }
        };
        match command {
            Command::Send(message) => {
                self.queue.enqueue(message);
                ApplyOutcome::None
            }
            Command::Receive => match self.queue.dequeue() {
                Some(message) => ApplyOutcome::Message(message),
                None => ApplyOutcome::None,
            },
        }
    }

    fn snapshot(&mut self) -> Result<QueueSnapshot<T>> {
        Ok(QueueSnapshot::new(self.queue.copy()))
    }

    /// The local queue is only replaced once the whole image decoded.
    fn restore(&mut self, reader: &mut dyn Read) -> Result<()> {
        let restored = decode_image(reader)?;
        self.queue.replace(restored);
        Ok(())
    }
}

/// A node of the replicated queue.
pub struct Store<T> {
    id: u64,
    queue: Arc<Queue<T>>,
    node: NodeHandle<ApplyOutcome<T>>,
    membership: Membership<NodeHandle<ApplyOutcome<T>>>,
    runtime: Mutex<Option<NodeRuntime<ApplyOutcome<T>>>>,
    raft_addr: String,
    apply_timeout: Duration,
}

impl<T: Payload> Store<T> {
    /// Starts the raft node backing this store.
    pub fn start(config: NodeConfig) -> Result<Self> {
        let id = config.id;
        let apply_timeout = config.options.apply_timeout;
        let queue = Arc::new(Queue::new());
        let runtime = spawn_node(config, QueueStateMachine::new(Arc::clone(&queue)))?;
        let node = runtime.handle();

        Ok(Self {
            id,
            queue,
            membership: Membership::new(node.clone(), apply_timeout),
            node,
            raft_addr: runtime.advertise_addr().to_string(),
            runtime: Mutex::new(Some(runtime)),
            apply_timeout,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address other nodes use to reach this one.
    pub fn raft_addr(&self) -> &str {
        &self.raft_addr
    }

    fn ensure_leader(&self) -> Result<()> {
        let (role, leader) = self.node.role()?;
        if role != StateRole::Leader {
            return Err(Error::NotLeader { leader });
        }
        Ok(())
    }

    /// Enqueues `data` on every node. Returns once the entry is applied here.
    pub fn send(&self, data: T) -> Result<()> {
        self.ensure_leader()?;
        let bytes = Command::Send(Message::new(data)).encode()?;
        match self.node.submit(bytes, self.apply_timeout)? {
            ApplyOutcome::Error(err) => Err(err),
            ApplyOutcome::None | ApplyOutcome::Message(_) => Ok(()),
        }
    }

    /// Dequeues the oldest message on every node and returns it here.
    /// `Ok(None)` means the queue was empty.
    pub fn receive(&self) -> Result<Option<Message<T>>> {
        self.ensure_leader()?;
        let bytes = Command::<T>::Receive.encode()?;
        match self.node.submit(bytes, self.apply_timeout)? {
            ApplyOutcome::None => Ok(None),
            ApplyOutcome::Message(message) => Ok(Some(message)),
            ApplyOutcome::Error(err) => Err(err),
        }
    }

    /// Consensus status. Never touches the queue.
    pub fn stats(&self) -> Result<BTreeMap<String, String>> {
        Ok(stats_map(&self.node.status()?))
    }

    pub fn join(&self, id: u64, address: &str) -> Result<()> {
        self.membership.join(id, address)
    }

    pub fn remove(&self, id: u64) -> Result<()> {
        self.membership.remove(id)
    }

    pub fn configuration(&self) -> Result<Configuration> {
        self.membership.configuration()
    }

    /// Compacts the log into a fresh snapshot and returns its index.
    pub fn snapshot(&self) -> Result<u64> {
        self.node.snapshot(self.apply_timeout)
    }

    pub fn status(&self) -> Result<NodeStatus> {
        self.node.status()
    }

    /// Blocks until this node leads and has applied everything it committed,
    /// so membership changes are accepted.
    pub fn wait_for_leader(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.node.status()?;
            if status.role == StateRole::Leader
                && !status.conf_change_pending
                && status.applied_index >= status.commit_index
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// Messages applied on this node, oldest first. Followers converge to
    /// the leader's queue through replication only.
    pub fn local_messages(&self) -> Vec<Message<T>> {
        self.queue.messages()
    }

    /// Stops the node and waits for its threads. Later calls fail with
    /// [`Error::Stopped`].
    pub fn stop(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.stop();
        }
    }
}

fn stats_map(status: &NodeStatus) -> BTreeMap<String, String> {
    let config = &status.configuration;
    let members: Vec<String> = config
        .members
        .iter()
        .map(|m| format!("{}@{}", m.id, m.address))
        .collect();
    let peers = config.members.iter().filter(|m| m.id != status.id).count();
    let leader = status
        .leader_id
        .map_or_else(|| "none".to_string(), |id| id.to_string());

    BTreeMap::from([
        ("id".to_string(), status.id.to_string()),
        ("state".to_string(), format!("{:?}", status.role)),
        ("term".to_string(), status.term.to_string()),
        ("leader_id".to_string(), leader),
        ("commit_index".to_string(), status.commit_index.to_string()),
        ("applied_index".to_string(), status.applied_index.to_string()),
        ("last_log_index".to_string(), status.last_log_index.to_string()),
        ("last_snapshot_index".to_string(), status.snapshot_index.to_string()),
        ("num_peers".to_string(), peers.to_string()),
        ("latest_configuration".to_string(), format!("[{}]", members.join(", "))),
        ("latest_configuration_index".to_string(), config.index.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::FsmSnapshot;
    use crate::membership::ClusterMember;
    use crate::message::Comment;
    use crate::snapshot::{BufferSink, SnapshotSink};

    fn machine() -> (Arc<Queue<Comment>>, QueueStateMachine<Comment>) {
        let queue = Arc::new(Queue::new());
        (Arc::clone(&queue), QueueStateMachine::new(queue))
    }

    fn send(fsm: &mut QueueStateMachine<Comment>, author: &str, content: &str) -> ApplyOutcome<Comment> {
        let bytes = Command::Send(Message::new(Comment::new(author, content)))
            .encode()
            .unwrap();
        fsm.apply(&bytes)
    }

    fn receive(fsm: &mut QueueStateMachine<Comment>) -> ApplyOutcome<Comment> {
        fsm.apply(&Command::<Comment>::Receive.encode().unwrap())
    }

    #[test]
    fn receive_returns_sends_in_order_then_nothing() {
        let (_, mut fsm) = machine();
        assert!(matches!(send(&mut fsm, "Alice", "Hello, World!"), ApplyOutcome::None));
        assert!(matches!(send(&mut fsm, "Bob", "again"), ApplyOutcome::None));

        match receive(&mut fsm) {
            ApplyOutcome::Message(msg) => assert_eq!(msg.data, Comment::new("Alice", "Hello, World!")),
            other => panic!("expected a message, got {other:?}"),
        }
        match receive(&mut fsm) {
            ApplyOutcome::Message(msg) => assert_eq!(msg.data.author, "Bob"),
            other => panic!("expected a message, got {other:?}"),
        }
        assert!(matches!(receive(&mut fsm), ApplyOutcome::None));
    }

    #[test]
    fn bad_entries_fail_without_touching_the_queue() {
        let (queue, mut fsm) = machine();
        send(&mut fsm, "Alice", "kept");

        assert!(matches!(fsm.apply(b"\xff\xff"), ApplyOutcome::Error(_)));
        let unknown = bincode::serialize(&(9u8, Option::<Message<Comment>>::None)).unwrap();
        assert!(matches!(
            fsm.apply(&unknown),
            ApplyOutcome::Error(Error::UnknownOperation(9))
        ));

        assert_eq!(queue.len(), 1);
        // Later entries still apply.
        assert!(matches!(receive(&mut fsm), ApplyOutcome::Message(_)));
    }

    #[test]
    fn snapshot_is_isolated_and_restores_elsewhere() {
        let (queue, mut fsm) = machine();
        send(&mut fsm, "Alice", "one");
        send(&mut fsm, "Alice", "two");

        let mut snapshot = fsm.snapshot().unwrap();
        send(&mut fsm, "Alice", "after snapshot");
        receive(&mut fsm);

        let mut sink = BufferSink::new("test");
        FsmSnapshot::persist(&snapshot, &mut sink).unwrap();
        FsmSnapshot::release(&mut snapshot);
        assert_eq!(sink.id(), "test");
        let image = sink.into_bytes().unwrap();

        let (restored, mut other) = machine();
        other.restore(&mut image.as_slice()).unwrap();
        let contents: Vec<_> = restored
            .messages()
            .into_iter()
            .map(|m| m.data.content)
            .collect();
        assert_eq!(contents, vec!["one", "two"]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn failed_restore_keeps_the_current_queue() {
        let (queue, mut fsm) = machine();
        send(&mut fsm, "Alice", "still here");

        let err = fsm.restore(&mut &b"\x01\x05"[..]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn stats_describe_the_configuration() {
        let status = NodeStatus {
            id: 1,
            role: StateRole::Leader,
            leader_id: Some(1),
            term: 2,
            commit_index: 7,
            applied_index: 7,
            last_log_index: 7,
            snapshot_index: 1,
            conf_change_pending: false,
            configuration: Configuration {
                index: 3,
                members: vec![
                    ClusterMember {
                        id: 1,
                        address: "127.0.0.1:7001".into(),
                    },
                    ClusterMember {
                        id: 2,
                        address: "127.0.0.1:7002".into(),
                    },
                ],
            },
        };
        let stats = stats_map(&status);
        assert_eq!(stats["state"], "Leader");
        assert_eq!(stats["num_peers"], "1");
        assert_eq!(stats["latest_configuration"], "[1@127.0.0.1:7001, 2@127.0.0.1:7002]");
        assert_eq!(stats["latest_configuration_index"], "3");
    }
}
