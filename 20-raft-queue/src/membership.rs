//! Cluster membership: seeding the first member and reconciling joins.
//!
//! The configuration itself is owned by the consensus log. This module only
//! reads it and proposes add/remove changes, each of which commits through
//! the log like any other entry.

use std::time::Duration;

use raft::prelude::{ConfState, Snapshot};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::node::{SnapshotEnvelope, build_snapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: u64,
    pub address: String,
}

/// Members as of the configuration entry at `index`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub index: u64,
    pub members: Vec<ClusterMember>,
}

impl Configuration {
    pub fn member(&self, id: u64) -> Option<&ClusterMember> {
        self.members.iter().find(|m| m.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    AddVoter { id: u64, address: String },
    Remove { id: u64 },
}

/// Membership primitives of the consensus engine.
pub trait ClusterControl {
    fn configuration(&self) -> Result<Configuration>;

    fn add_voter(&self, id: u64, address: &str, prior_index: u64, timeout: Duration)
        -> Result<()>;

    fn remove_member(&self, id: u64, prior_index: u64, timeout: Duration) -> Result<()>;
}

/// Initial log image for the bootstrapping node: itself as the only voter,
/// next to the empty state machine `image`.
pub fn bootstrap_snapshot(id: u64, address: &str, image: Vec<u8>) -> Result<Snapshot> {
    let envelope = SnapshotEnvelope {
        members: [(id, address.to_string())].into_iter().collect(),
        state: image,
    };
    build_snapshot(1, 1, ConfState::from((vec![id], vec![])), &envelope)
}

pub struct Membership<C> {
    control: C,
    timeout: Duration,
}

impl<C: ClusterControl> Membership<C> {
    pub fn new(control: C, timeout: Duration) -> Self {
        Self { control, timeout }
    }

    pub fn configuration(&self) -> Result<Configuration> {
        self.control.configuration()
    }

    /// Adds `id` at `address` as a voter.
    ///
    /// A member that already matches both is left alone. A member that
    /// matches only the id or only the address is removed first.
    pub fn join(&self, id: u64, address: &str) -> Result<()> {
        let config = self.control.configuration()?;
        let mut prior_index = config.index;

        for member in &config.members {
            let same_id = member.id == id;
            let same_address = member.address == address;
            if same_id && same_address {
                info!(member = id, %address, "already a member, ignoring join");
                return Ok(());
            }
            if !(same_id || same_address) {
                continue;
            }
            self.control
                .remove_member(member.id, prior_index, self.timeout)
                .map_err(|source| Error::Membership {
                    action: "remove",
                    id: member.id,
                    address: member.address.clone(),
                    source: Box::new(source),
                })?;
            info!(member = member.id, address = %member.address, "removed conflicting member");
            // The configuration moved on; the add below must not pin the old index.
            prior_index = 0;
        }

        self.control
            .add_voter(id, address, prior_index, self.timeout)
            .map_err(|source| Error::Membership {
                action: "add",
                id,
                address: address.to_string(),
                source: Box::new(source),
            })?;
        info!(member = id, %address, "member joined");
        Ok(())
    }

    pub fn remove(&self, id: u64) -> Result<()> {
        let config = self.control.configuration()?;
        let Some(member) = config.member(id) else {
            return Ok(());
        };
        self.control
            .remove_member(id, config.index, self.timeout)
            .map_err(|source| Error::Membership {
                action: "remove",
                id,
                address: member.address.clone(),
                source: Box::new(source),
            })
    }
}
