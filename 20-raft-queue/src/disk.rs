//! On-disk raft state under a node's data directory.
//!
//! ```text
//! <data-dir>/
//! ├── hardstate.json            term, vote and commit
//! ├── raft.log                  [u32 len][protobuf Entry] records, appended
//! └── snapshots/
//!     └── snapshot_<index>.snap protobuf Snapshot, newest two kept
//! ```
//!
//! `hardstate.json` and snapshot files are replaced with a temp-file write,
//! `sync_all` and rename. The log is only appended to between compactions.
//! A record whose index is at or below an earlier one supersedes that record
//! and everything after it, which is how raft truncates a conflicting
//! suffix. After a snapshot is installed or the log compacted the log file
//! is rewritten whole.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use prost::Message as ProstMessage;
use raft::prelude::{Entry, HardState, Snapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Snapshot files kept on disk, newest first.
pub const RETAINED_SNAPSHOTS: usize = 2;

const HARD_STATE_FILE: &str = "hardstate.json";
const LOG_FILE: &str = "raft.log";
const SNAPSHOT_DIR: &str = "snapshots";

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedHardState {
    term: u64,
    vote: u64,
    commit: u64,
}

/// Everything read back from a data directory.
#[derive(Debug, Default)]
pub struct Recovered {
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
    /// Contiguous entries following the snapshot.
    pub entries: Vec<Entry>,
}

impl Recovered {
    /// False for a data directory that has never held raft state.
    pub fn has_state(&self) -> bool {
        self.snapshot.is_some() || self.hard_state.term > 0 || !self.entries.is_empty()
    }
}

pub struct DiskLog {
    dir: PathBuf,
    log: BufWriter<File>,
}

impl DiskLog {
    /// Opens (creating if needed) the data directory and reads back what a
    /// previous run left there.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<(Self, Recovered)> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(SNAPSHOT_DIR))?;

        let hard_state = load_hard_state(&dir.join(HARD_STATE_FILE))?;
        let snapshot = load_latest_snapshot(&dir.join(SNAPSHOT_DIR));
        let snapshot_index = snapshot.as_ref().map_or(0, |s| s.get_metadata().index);
        let (entries, clean) = load_entries(&dir.join(LOG_FILE), snapshot_index)?;

        let log = open_append(&dir.join(LOG_FILE))?;
        let mut disk = Self { dir, log };
        if !clean {
            disk.rewrite_log(&entries)?;
        }
        debug!(
            dir = %disk.dir.display(),
            snapshot_index,
            entries = entries.len(),
            term = hard_state.term,
            "opened raft data directory"
        );
        Ok((
            disk,
            Recovered {
                hard_state,
                snapshot,
                entries,
            },
        ))
    }

    pub fn save_hard_state(&self, hs: &HardState) -> io::Result<()> {
        let persisted = PersistedHardState {
            term: hs.term,
            vote: hs.vote,
            commit: hs.commit,
        };
        write_atomically(&self.dir.join(HARD_STATE_FILE), |writer| {
            serde_json::to_writer(writer, &persisted)
                .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
        })
    }

    /// Appends entries and syncs them before returning.
    pub fn append(&mut self, entries: &[Entry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        for entry in entries {
            write_record(&mut self.log, entry)?;
        }
        self.log.flush()?;
        self.log.get_ref().sync_data()
    }

    /// Replaces the log file with exactly `entries`.
    pub fn rewrite_log(&mut self, entries: &[Entry]) -> io::Result<()> {
        let path = self.dir.join(LOG_FILE);
        write_atomically(&path, |writer| {
            for entry in entries {
                write_record(writer, entry)?;
            }
            Ok(())
        })?;
        self.log = open_append(&path)?;
        Ok(())
    }

    /// Writes `snapshot` next to the older ones and prunes beyond
    /// [`RETAINED_SNAPSHOTS`].
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> io::Result<()> {
        let index = snapshot.get_metadata().index;
        let dir = self.dir.join(SNAPSHOT_DIR);
        let bytes = snapshot.encode_to_vec();
        write_atomically(&snapshot_path(&dir, index), |writer| writer.write_all(&bytes))?;
        debug!(index, bytes = bytes.len(), "wrote snapshot file");
        cleanup_old_snapshots(&dir);
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Writes through `fill` into a temp file, syncs it and renames it over `path`.
fn write_atomically(
    path: &Path,
    fill: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>,
) -> io::Result<()> {
    let temp_path = path.with_extension("tmp");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    let mut writer = BufWriter::new(file);
    fill(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&temp_path, path)
}

fn write_record(writer: &mut impl Write, entry: &Entry) -> io::Result<()> {
    let bytes = entry.encode_to_vec();
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "log entry too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&bytes)
}

fn load_hard_state(path: &Path) -> io::Result<HardState> {
    if !path.exists() {
        return Ok(HardState::default());
    }
    let reader = BufReader::new(File::open(path)?);
    let persisted: PersistedHardState = serde_json::from_reader(reader)
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    let mut hs = HardState::default();
    hs.term = persisted.term;
    hs.vote = persisted.vote;
    hs.commit = persisted.commit;
    Ok(hs)
}

/// Replays the log, keeping only entries after `snapshot_index`. A torn
/// record at the tail, as left by a crash mid-append, ends the replay.
/// Returns false alongside the entries when the file needs rewriting.
fn load_entries(path: &Path, snapshot_index: u64) -> io::Result<(Vec<Entry>, bool)> {
    if !path.exists() {
        return Ok((Vec::new(), true));
    }
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut entries: Vec<Entry> = Vec::new();
    let mut offset = 0u64;

    while offset < file_len {
        let entry = read_record(&mut reader, file_len - offset);
        let entry = match entry {
            Ok((entry, read)) if entry.index > 0 => {
                offset += read;
                entry
            }
            Ok(_) => {
                warn!(path = %path.display(), offset, "ignoring raft log tail without an index");
                break;
            }
            Err(err) => {
                warn!(path = %path.display(), offset, error = %err, "ignoring torn raft log tail");
                break;
            }
        };

        while entries.last().is_some_and(|last| last.index >= entry.index) {
            entries.pop();
        }
        entries.push(entry);
    }

    let mut clean = offset == file_len;
    entries.retain(|entry| entry.index > snapshot_index);
    if let Some(first) = entries.first() {
        if first.index != snapshot_index + 1 {
            warn!(
                snapshot_index,
                first = first.index,
                "raft log does not follow the snapshot; discarding it"
            );
            entries.clear();
            clean = false;
        }
    }
    Ok((entries, clean))
}

/// Reads one record no longer than `remaining` bytes, returning the entry
/// and the bytes consumed.
fn read_record(reader: &mut impl Read, remaining: u64) -> io::Result<(Entry, u64)> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u64::from(u32::from_be_bytes(len_buf));
    if len + 4 > remaining {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "record runs past end of file"));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    let entry = Entry::decode(&buf[..]).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    Ok((entry, len + 4))
}

fn snapshot_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("snapshot_{index:016x}.snap"))
}

/// Indexes of snapshot files in `dir`, ascending.
fn snapshot_indexes(dir: &Path) -> Vec<u64> {
    let mut indexes: Vec<u64> = fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let hex = name.strip_prefix("snapshot_")?.strip_suffix(".snap")?;
            u64::from_str_radix(hex, 16).ok()
        })
        .collect();
    indexes.sort_unstable();
    indexes
}

/// The newest snapshot that decodes. Unreadable files are skipped with a
/// warning so an older image can still be used.
fn load_latest_snapshot(dir: &Path) -> Option<Snapshot> {
    for index in snapshot_indexes(dir).into_iter().rev() {
        let loaded = fs::read(snapshot_path(dir, index)).and_then(|bytes| {
            Snapshot::decode(&bytes[..]).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
        });
        match loaded {
            Ok(snapshot) if snapshot.get_metadata().index == index => return Some(snapshot),
            Ok(_) => warn!(index, "snapshot file does not match its name, trying older one"),
            Err(err) => warn!(index, error = %err, "failed to load snapshot, trying older one"),
        }
    }
    None
}

fn cleanup_old_snapshots(dir: &Path) {
    let indexes = snapshot_indexes(dir);
    let excess = indexes.len().saturating_sub(RETAINED_SNAPSHOTS);
    for index in &indexes[..excess] {
        match fs::remove_file(snapshot_path(dir, *index)) {
            Ok(()) => debug!(index, "removed old snapshot"),
            Err(err) => warn!(index, error = %err, "failed to remove old snapshot"),
        }
    }
}
