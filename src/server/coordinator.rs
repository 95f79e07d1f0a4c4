//! Leadership and membership coordination.
//!
//! Receives the state machine's leader, peer and snapshot notifications and
//! turns them into [`LeaderInfo`] updates and domain side effects. Handlers
//! run inline on the raft loop, so they only swap pointers, touch small maps
//! and spawn or abort tasks.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use crate::common::{Error, PeerAddr, Result};
use crate::metadata::handler::{
    LeaderChange, LeaderChangeHandler, PeerChange, PeerChangeHandler, PeerChangeKind,
    SnapshotAppliedHandler,
};
use crate::server::cluster::Cluster;

/// Who leads the metadata partition, as last observed here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderInfo {
    pub leader_id: u64,
    /// Management address of the leader; empty when unknown.
    pub addr: String,
    pub term: u64,
    pub is_self: bool,
}

pub struct Coordinator {
    node_id: u64,
    leader: ArcSwap<LeaderInfo>,
    addresses: RwLock<BTreeMap<u64, String>>,
    cluster: OnceLock<Weak<Cluster>>,
}

impl Coordinator {
    pub fn new(node_id: u64, peers: &[PeerAddr]) -> Self {
        Self {
            node_id,
            leader: ArcSwap::from_pointee(LeaderInfo::default()),
            addresses: RwLock::new(peers.iter().map(|p| (p.id, p.addr())).collect()),
            cluster: OnceLock::new(),
        }
    }

    pub fn leader_info(&self) -> Arc<LeaderInfo> {
        self.leader.load_full()
    }

    /// Mutating requests are only accepted by the leader.
    pub fn is_ready(&self) -> bool {
        self.leader.load().is_self
    }

    pub fn ensure_leader(&self) -> Result<()> {
        let info = self.leader.load();
        if info.is_self {
            return Ok(());
        }
        Err(Error::NotLeader {
            leader: (!info.addr.is_empty()).then(|| info.addr.clone()),
        })
    }

    pub fn peers(&self) -> Vec<(u64, String)> {
        self.addresses
            .read()
            .iter()
            .map(|(id, addr)| (*id, addr.clone()))
            .collect()
    }

    /// Hand over the cluster subsystem. Starts its scheduling right away when
    /// leadership was won before the subsystem existed.
    ///
    /// Only a weak reference is kept: the state machine owns this coordinator
    /// and the cluster owns the state machine.
    pub fn attach_cluster(&self, cluster: &Arc<Cluster>) -> Result<()> {
        self.cluster
            .set(Arc::downgrade(cluster))
            .map_err(|_| Error::AlreadyRegistered("cluster"))?;
        if self.is_ready() {
            cluster.start_scheduling();
        }
        Ok(())
    }

    fn cluster(&self) -> Option<Arc<Cluster>> {
        self.cluster.get().and_then(Weak::upgrade)
    }
}

impl LeaderChangeHandler for Coordinator {
    fn on_leader_change(&self, change: LeaderChange) {
        let addr = self
            .addresses
            .read()
            .get(&change.leader_id)
            .cloned()
            .unwrap_or_default();
        let next = LeaderInfo {
            leader_id: change.leader_id,
            addr,
            term: change.term,
            is_self: change.leader_id != 0 && change.leader_id == self.node_id,
        };
        let became_leader = next.is_self;
        let prev = self.leader.swap(Arc::new(next));

        match (prev.is_self, became_leader) {
            (false, true) => {
                tracing::info!("became leader at term {}", change.term);
                if let Some(cluster) = self.cluster() {
                    cluster.start_scheduling();
                }
            }
            (true, false) => {
                tracing::warn!(
                    "lost leadership at term {}, new leader {}",
                    change.term,
                    change.leader_id
                );
                if let Some(cluster) = self.cluster() {
                    cluster.stop_scheduling();
                }
            }
            _ if prev.leader_id != change.leader_id => {
                tracing::info!(
                    "following leader {} at term {}",
                    change.leader_id,
                    change.term
                );
            }
            _ => {}
        }
    }
}

impl PeerChangeHandler for Coordinator {
    fn on_peer_change(&self, change: &PeerChange) {
        let mut addresses = self.addresses.write();
        match change.kind {
            PeerChangeKind::Add => {
                addresses.insert(change.id, change.addr.clone());
            }
            PeerChangeKind::Remove => {
                addresses.remove(&change.id);
            }
        }
        tracing::info!(
            "peer {:?} {} {}, members now {:?}",
            change.kind,
            change.id,
            change.addr,
            addresses.keys().collect::<Vec<_>>()
        );
    }
}

impl SnapshotAppliedHandler for Coordinator {
    fn on_snapshot_applied(&self, applied_index: u64) {
        tracing::info!("metadata replaced by snapshot at {}", applied_index);
        if let Some(cluster) = self.cluster() {
            cluster.on_snapshot_applied();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> Vec<PeerAddr> {
        (1..=3)
            .map(|id| PeerAddr {
                id,
                host: format!("10.0.0.{id}"),
                port: 17010,
            })
            .collect()
    }

    #[test]
    fn test_leader_then_follower_ends_on_final_leader() {
        let c = Coordinator::new(1, &peers());
        let before = c.leader_info();
        assert_eq!(*before, LeaderInfo::default());

        c.on_leader_change(LeaderChange {
            leader_id: 1,
            term: 2,
        });
        assert!(c.is_ready());
        c.on_leader_change(LeaderChange {
            leader_id: 3,
            term: 3,
        });

        let after = c.leader_info();
        assert_eq!(
            *after,
            LeaderInfo {
                leader_id: 3,
                addr: "10.0.0.3:17010".into(),
                term: 3,
                is_self: false,
            }
        );
        assert!(!c.is_ready());
        match c.ensure_leader() {
            Err(Error::NotLeader { leader }) => assert_eq!(leader.as_deref(), Some("10.0.0.3:17010")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_leader_has_no_address() {
        let c = Coordinator::new(1, &peers());
        c.on_leader_change(LeaderChange {
            leader_id: 0,
            term: 5,
        });
        assert!(matches!(
            c.ensure_leader(),
            Err(Error::NotLeader { leader: None })
        ));
    }

    #[test]
    fn test_peer_changes_update_address_book() {
        let c = Coordinator::new(1, &peers());
        c.on_peer_change(&PeerChange {
            kind: PeerChangeKind::Add,
            id: 4,
            addr: "10.0.0.4:17010".into(),
        });
        c.on_peer_change(&PeerChange {
            kind: PeerChangeKind::Remove,
            id: 2,
            addr: String::new(),
        });
        let ids: Vec<u64> = c.peers().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 3, 4]);

        c.on_leader_change(LeaderChange {
            leader_id: 4,
            term: 9,
        });
        assert_eq!(c.leader_info().addr, "10.0.0.4:17010");
    }
}
