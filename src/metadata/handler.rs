//! Extension points through which domain logic plugs into the state machine.
//!
//! Each capability is installed once, before the state machine is restored;
//! the state machine rejects a second registration for the same capability.

use crate::common::Result;
use crate::master::MetaCmd;

/// A single store mutation produced by a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Mutation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Mutation::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Mutation::Delete { key: key.into() }
    }
}

/// What a command handler wants persisted, plus the reply for the proposer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub mutations: Vec<Mutation>,
    pub response: Vec<u8>,
}

/// Read-only view of committed metadata.
pub trait StoreReader {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Interprets committed commands.
///
/// Must be deterministic: the output may depend only on `cmd` and `store`.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, cmd: &MetaCmd, store: &dyn StoreReader) -> Result<CommandOutput>;
}

/// Leadership as reported by the consensus layer. `leader_id == 0` means no
/// leader is currently known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderChange {
    pub leader_id: u64,
    pub term: u64,
}

pub trait LeaderChangeHandler: Send + Sync {
    fn on_leader_change(&self, change: LeaderChange);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerChangeKind {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerChange {
    pub kind: PeerChangeKind,
    pub id: u64,
    /// Management address carried in the membership entry (may be empty on remove).
    pub addr: String,
}

pub trait PeerChangeHandler: Send + Sync {
    fn on_peer_change(&self, change: &PeerChange);
}

/// Invoked after a follower replaced its store from a leader snapshot.
pub trait SnapshotAppliedHandler: Send + Sync {
    fn on_snapshot_applied(&self, applied_index: u64);
}
