//! Raft-replicated FIFO message queue.
//!
//! Every node holds a copy of one queue. `send` and `receive` are appended to
//! the Raft log by the leader and applied on every node in log order, so all
//! replicas dequeue the same messages in the same order. A `receive` is a
//! replicated write too: it removes the message everywhere.
//!
//! # Architecture
//!
//! - **Worker thread**: drives the Raft node, applies committed entries to the
//!   queue, answers client requests
//! - **Network listener thread**: accepts Raft messages from peers
//! - **Snapshot threads**: persist a captured queue copy while the worker
//!   keeps applying
//! - **HTTP server**: a tokio/axum front end that hands blocking store calls
//!   to `spawn_blocking`
//!
//! Threads talk over crossbeam channels, so Raft state stays single-threaded.
//! New members are always brought up to date with a snapshot: the queue image
//! plus the member address book. With a data directory the hard state, log
//! and the two newest snapshots are kept on disk, and a restarted node
//! resumes from them.
//!
//! # Why replicate `receive`?
//!
//! - **One owner per message**: only the leader answers, and the dequeue it
//!   answers with is the same one every replica applies
//! - **No read path to go stale**: followers never serve a queue view that
//!   could already be consumed elsewhere
//! - **Cost**: a receive waits for a quorum round trip like a send does
//!
//! # Modules
//!
//! - [`queue`]: thread-safe FIFO of [`Message`]s
//! - [`command`]: queue commands replicated through the log
//! - [`snapshot`]: queue images and the sinks they are written to
//! - [`fsm`]: the state machine contract the Raft node drives
//! - [`node`]: tikv/raft `RawNode` wrapper
//! - [`storage`]: Raft log with a snapshot image, optionally on disk
//! - [`disk`]: data directory layout and crash-safe writes
//! - [`transport`]: TCP framing of Raft messages
//! - [`runtime`]: worker loop, node spawning, [`NodeHandle`]
//! - [`membership`]: bootstrap and join reconciliation
//! - [`store`]: the replicated queue clients use
//! - [`http`]: REST adapter over [`Store`]

pub mod command;
pub mod config;
pub mod disk;
pub mod error;
pub mod fsm;
pub mod http;
pub mod membership;
pub mod message;
pub mod node;
pub mod queue;
pub mod runtime;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod transport;

pub use config::{NodeConfig, RaftOptions};
pub use error::{Error, ErrorKind, Result};
pub use membership::{ClusterMember, Configuration};
pub use message::{Comment, Message};
pub use queue::Queue;
pub use runtime::NodeHandle;
pub use store::{Payload, Store};
