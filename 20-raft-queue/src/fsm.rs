//! The contract between the consensus glue and an application state machine.
//!
//! The raft worker calls these methods one at a time from its own thread:
//! `apply` once per committed entry in log order, `snapshot` when compacting
//! and `restore` when a leader ships a snapshot.

use std::io::Read;

use crate::error::Result;
use crate::snapshot::SnapshotSink;

pub trait StateMachine: Send + 'static {
    /// Result handed back to the proposer of an entry.
    type Output: Send + 'static;
    type Snapshot: FsmSnapshot;

    /// Applies one committed entry. Must be deterministic: no I/O, clocks or
    /// randomness, since every replica runs it on the same bytes.
    fn apply(&mut self, entry: &[u8]) -> Self::Output;

    /// Captures the current state. Only the copy happens here; persisting it
    /// runs later, off the apply path.
    fn snapshot(&mut self) -> Result<Self::Snapshot>;

    /// Replaces the whole state with the image read from `reader`.
    fn restore(&mut self, reader: &mut dyn Read) -> Result<()>;
}

pub trait FsmSnapshot: Send + 'static {
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<()>;
    fn release(&mut self);
}
