//! Raft log storage with snapshot support.
//!
//! `MemStorage` keeps the log and hard state but builds snapshots without any
//! application data. This wrapper remembers the latest compacted image and
//! serves it to the raft leader when a follower has fallen behind the log.
//! With a data directory every write also goes to a [`DiskLog`] before it is
//! acknowledged, and [`SnapshotStorage::open`] rebuilds the in-memory state
//! from it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::{GetEntriesContext, MemStorage, RaftState, Storage};
use raft::StorageError;
use tracing::info;

use crate::disk::DiskLog;

#[derive(Clone, Default)]
pub struct SnapshotStorage {
    core: MemStorage,
    image: Arc<RwLock<Snapshot>>,
    wanted: Arc<AtomicBool>,
    disk: Option<Arc<Mutex<DiskLog>>>,
}

impl SnapshotStorage {
    /// Storage that lives only as long as the process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage backed by `dir`, loaded with whatever an earlier run
    /// persisted there. The recovered image is available through
    /// [`image`](Self::image).
    pub fn open(dir: &Path) -> raft::Result<Self> {
        let (disk, recovered) = DiskLog::open(dir)?;
        let restarted = recovered.has_state();
        let storage = Self {
            disk: Some(Arc::new(Mutex::new(disk))),
            ..Self::default()
        };

        let mut core = storage.core.wl();
        if let Some(snapshot) = recovered.snapshot {
            core.apply_snapshot(snapshot.clone())?;
            *storage.image.write() = snapshot;
        }
        if !recovered.entries.is_empty() {
            core.append(&recovered.entries)?;
        }
        if restarted {
            // Raft panics on a commit index past the log, so clamp what a
            // crash between log and hard state writes may have left.
            let snapshot_index = storage.snapshot_index();
            let last_index = recovered.entries.last().map_or(snapshot_index, |e| e.index);
            let mut hs = recovered.hard_state;
            hs.term = hs.term.max(core.hard_state().term);
            hs.commit = hs.commit.clamp(snapshot_index, last_index);
            core.set_hardstate(hs);
            info!(
                dir = %dir.display(),
                snapshot_index,
                last_index,
                term = core.hard_state().term,
                "recovered raft state"
            );
        }
        drop(core);
        Ok(storage)
    }

    /// True when the node starts from persisted state instead of a blank log.
    pub fn has_state(&self) -> bool {
        let core = self.core.rl();
        self.snapshot_index() > 0 || core.hard_state().term > 0
    }

    /// Replaces log and image with `snapshot`, as when bootstrapping or when
    /// a leader ships one.
    pub fn install(&self, snapshot: Snapshot) -> raft::Result<()> {
        self.core.wl().apply_snapshot(snapshot.clone())?;
        if let Some(disk) = &self.disk {
            let mut disk = disk.lock();
            disk.save_snapshot(&snapshot)?;
            disk.rewrite_log(&[])?;
            disk.save_hard_state(self.core.rl().hard_state())?;
        }
        *self.image.write() = snapshot;
        Ok(())
    }

    /// Drops log entries before the snapshot index and keeps the image for
    /// lagging followers. Stale images are ignored.
    pub fn compact(&self, snapshot: Snapshot) -> raft::Result<bool> {
        let index = snapshot.get_metadata().index;
        if index <= self.snapshot_index() {
            return Ok(false);
        }
        self.core.wl().compact(index)?;
        if let Some(disk) = &self.disk {
            let remaining = self.remaining_entries()?;
            let mut disk = disk.lock();
            disk.save_snapshot(&snapshot)?;
            disk.rewrite_log(&remaining)?;
        }
        *self.image.write() = snapshot;
        Ok(true)
    }

    fn remaining_entries(&self) -> raft::Result<Vec<Entry>> {
        let first = self.core.first_index()?;
        let last = self.core.last_index()?;
        if last < first {
            return Ok(Vec::new());
        }
        self.core
            .entries(first, last + 1, None, GetEntriesContext::empty(false))
    }

    pub fn append(&self, entries: &[Entry]) -> raft::Result<()> {
        self.core.wl().append(entries)?;
        if let Some(disk) = &self.disk {
            disk.lock().append(entries)?;
        }
        Ok(())
    }

    pub fn set_hardstate(&self, hs: HardState) -> raft::Result<()> {
        if let Some(disk) = &self.disk {
            disk.lock().save_hard_state(&hs)?;
        }
        self.core.wl().set_hardstate(hs);
        Ok(())
    }

    pub fn set_commit(&self, commit: u64) -> raft::Result<()> {
        let mut core = self.core.wl();
        core.mut_hard_state().set_commit(commit);
        if let Some(disk) = &self.disk {
            disk.lock().save_hard_state(core.hard_state())?;
        }
        Ok(())
    }

    pub fn set_conf_state(&self, cs: ConfState) {
        self.core.wl().set_conf_state(cs);
    }

    pub fn snapshot_index(&self) -> u64 {
        self.image.read().get_metadata().index
    }

    /// The latest compacted or installed image.
    pub fn image(&self) -> Snapshot {
        self.image.read().clone()
    }

    /// True once if raft asked for a snapshot the current image cannot serve.
    pub fn take_snapshot_request(&self) -> bool {
        self.wanted.swap(false, Ordering::AcqRel)
    }
}

impl Storage for SnapshotStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.core.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.core.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        {
            let image = self.image.read();
            let meta = image.get_metadata();
            if meta.index > 0 && idx == meta.index {
                return Ok(meta.term);
            }
        }
        self.core.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.core.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.core.last_index()
    }

    /// Hands out the stored image if it is recent enough and already lists
    /// `to` as a member. Otherwise a fresh capture is requested and raft
    /// retries on a later heartbeat.
    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let image = self.image.read();
        let meta = image.get_metadata();
        let cs = meta.get_conf_state();
        let covers_peer = cs.voters.contains(&to) || cs.learners.contains(&to);
        if image.data.is_empty() || meta.index < request_index || !covers_peer {
            self.wanted.store(true, Ordering::Release);
            return Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable));
        }
        Ok(image.clone())
    }
}
