//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Identity and addressing of one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique, non-zero node id.
    pub id: u64,
    /// Address to bind for raft traffic (e.g. "127.0.0.1:7001"). Port 0 picks
    /// an ephemeral port; the bound address is what peers are told.
    pub raft_addr: String,
    /// Address peers should dial when it differs from the bound one, e.g.
    /// when binding 0.0.0.0.
    pub advertise_addr: Option<String>,
    /// Seed a single-member cluster containing only this node. Only the
    /// initial leader does this; joining nodes start empty.
    pub bootstrap: bool,
    /// Where hard state, log and snapshots are kept. Without one, raft state
    /// lives in memory and the node must not come back under the same id.
    pub data_dir: Option<PathBuf>,
    pub options: RaftOptions,
}

impl NodeConfig {
    pub fn new(id: u64, raft_addr: impl Into<String>) -> Self {
        Self {
            id,
            raft_addr: raft_addr.into(),
            advertise_addr: None,
            bootstrap: false,
            data_dir: None,
            options: RaftOptions::default(),
        }
    }

    pub fn bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn advertise(mut self, addr: impl Into<String>) -> Self {
        self.advertise_addr = Some(addr.into());
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_options(mut self, options: RaftOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(Error::InvalidConfig("node id must be non-zero".into()));
        }
        self.options.validate()
    }
}

/// Timing and compaction knobs.
///
/// Election and heartbeat timeouts are measured in ticks, so with the
/// defaults a leader heartbeats every 300ms and followers campaign after
/// roughly one second of silence.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub tick_interval: Duration,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub max_inflight_msgs: usize,
    /// Bound on how long `send`, `receive` and membership changes wait for commit.
    pub apply_timeout: Duration,
    /// Applied entries since the last snapshot before the log is compacted.
    pub snapshot_threshold: u64,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            apply_timeout: Duration::from_secs(10),
            snapshot_threshold: 1024,
        }
    }
}

impl RaftOptions {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(Error::InvalidConfig("tick interval must be positive".into()));
        }
        if self.heartbeat_tick == 0 || self.heartbeat_tick >= self.election_tick {
            return Err(Error::InvalidConfig(
                "heartbeat tick must be positive and less than the election tick".into(),
            ));
        }
        if self.snapshot_threshold == 0 {
            return Err(Error::InvalidConfig("snapshot threshold must be positive".into()));
        }
        if self.apply_timeout.is_zero() {
            return Err(Error::InvalidConfig("apply timeout must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(NodeConfig::new(1, "127.0.0.1:0").validate().is_ok());
    }

    #[test]
    fn rejects_bad_timing() {
        let options = RaftOptions {
            heartbeat_tick: 10,
            ..RaftOptions::default()
        };
        assert!(matches!(options.validate(), Err(Error::InvalidConfig(_))));
        assert!(NodeConfig::new(0, "127.0.0.1:0").validate().is_err());
    }
}
