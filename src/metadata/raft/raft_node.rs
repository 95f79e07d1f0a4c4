use protobuf::Message as PbMessage;
use raft::prelude::Message as RaftMessage;
use raft::prelude::{ConfChange, ConfChangeType, ConfChangeV2, Entry, EntryType, Snapshot};
use raft::{RawNode, SnapshotStatus, StateRole};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use crate::common::config::split_host_port;
use crate::common::{Error, Result};
use crate::metadata::fsm::MetadataFsm;
use crate::metadata::handler::{LeaderChange, PeerChange, PeerChangeKind};
use crate::metadata::raft::cluster::RaftClusterState;
use crate::metadata::raft::raft_transport::{GrpcTransport, Transport, Unreachable};
use crate::metadata::raft::rocks_store::{PartitionStorage, RaftLogStore};

/// Work submitted to the raft loop by partition handles.
pub enum Proposal {
    Command {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Member {
        change: ConfChange,
        reply: oneshot::Sender<Result<()>>,
    },
}

enum Pending {
    Command(oneshot::Sender<Result<Vec<u8>>>),
    Member(oneshot::Sender<Result<()>>),
}

impl Pending {
    fn fail(self, err: Error) {
        match self {
            Pending::Command(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::Member(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

pub struct RaftInbox {
    pub net_rx: mpsc::Receiver<RaftMessage>,
    pub prop_rx: mpsc::Receiver<Proposal>,
    pub report_rx: mpsc::UnboundedReceiver<Unreachable>,
    pub stop_rx: watch::Receiver<bool>,
}

/// Proposal context: proposer id followed by a per-process sequence number.
fn encode_ctx(node_id: u64, seq: u64) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(16);
    ctx.extend_from_slice(&node_id.to_be_bytes());
    ctx.extend_from_slice(&seq.to_be_bytes());
    ctx
}

fn decode_ctx(ctx: &[u8]) -> Option<(u64, u64)> {
    if ctx.len() != 16 {
        return None;
    }
    let node = u64::from_be_bytes(ctx[..8].try_into().ok()?);
    let seq = u64::from_be_bytes(ctx[8..].try_into().ok()?);
    Some((node, seq))
}

fn raft_err(e: raft::Error) -> Error {
    Error::Internal(format!("raft: {e}"))
}

fn log_err(e: anyhow::Error) -> Error {
    Error::StoreIo(format!("raft log: {e:#}"))
}

/// Single task owning the RawNode; every committed entry is applied here,
/// in order.
pub struct RaftNode {
    node_id: u64,
    rn: RawNode<PartitionStorage>,
    log: RaftLogStore,
    sm: Arc<MetadataFsm>,
    transport: GrpcTransport,
    state: Arc<RaftClusterState>,
    tick: Duration,
    pending: HashMap<u64, Pending>,
    next_seq: u64,
    last_soft: (u64, StateRole),
}

impl RaftNode {
    pub fn new(
        rn: RawNode<PartitionStorage>,
        sm: Arc<MetadataFsm>,
        transport: GrpcTransport,
        state: Arc<RaftClusterState>,
        tick: Duration,
    ) -> Self {
        let log = rn.store().log().clone();
        let node_id = rn.raft.id;
        Self {
            node_id,
            rn,
            log,
            sm,
            transport,
            state,
            tick,
            pending: HashMap::new(),
            // random start so contexts from an earlier incarnation never match
            next_seq: uuid::Uuid::new_v4().as_u64_pair().0 >> 1,
            last_soft: (0, StateRole::Follower),
        }
    }

    pub async fn run(mut self, mut inbox: RaftInbox) -> Result<()> {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // A lone voter has nobody to wait for.
        let lone_voter = self
            .log
            .load_conf_state()
            .map_err(log_err)?
            .is_some_and(|cs| cs.voters == [self.node_id]);
        if lone_voter {
            self.rn.campaign().map_err(raft_err)?;
        }

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.rn.tick();
                },
                Some(msg) = inbox.net_rx.recv() => {
                    // Raft message received from another node
                    if let Err(e) = self.rn.step(msg) {
                        tracing::debug!("dropping raft message: {}", e);
                    }
                },
                Some(p) = inbox.prop_rx.recv() => self.propose(p),
                Some(r) = inbox.report_rx.recv() => {
                    self.rn.report_unreachable(r.to);
                    if r.snapshot {
                        self.rn.report_snapshot(r.to, SnapshotStatus::Failure);
                    }
                },
                _ = inbox.stop_rx.changed() => break Ok(()),
            }

            if let Err(e) = self.drain_ready().await {
                break Err(e);
            }
        };

        for (_, p) in self.pending.drain() {
            p.fail(Error::Closed);
        }
        result
    }

    fn propose(&mut self, proposal: Proposal) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let ctx = encode_ctx(self.node_id, seq);
        let leader = self.rn.raft.state == StateRole::Leader;
        match proposal {
            Proposal::Command { data, reply } => {
                if !leader {
                    let _ = reply.send(Err(Error::NotLeader { leader: None }));
                    return;
                }
                match self.rn.propose(ctx, data) {
                    Ok(()) => {
                        self.pending.insert(seq, Pending::Command(reply));
                    }
                    Err(e) => {
                        tracing::debug!("proposal dropped: {}", e);
                        let _ = reply.send(Err(Error::NotLeader { leader: None }));
                    }
                }
            }
            Proposal::Member { change, reply } => {
                if !leader {
                    let _ = reply.send(Err(Error::NotLeader { leader: None }));
                    return;
                }
                match self.rn.propose_conf_change(ctx, change) {
                    Ok(()) => {
                        self.pending.insert(seq, Pending::Member(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(Error::Internal(format!("conf change: {e}"))));
                    }
                }
            }
        }
    }

    async fn drain_ready(&mut self) -> Result<()> {
        while self.rn.has_ready() {
            self.on_ready().await?;
        }
        Ok(())
    }

    async fn on_ready(&mut self) -> Result<()> {
        let mut rd = self.rn.ready();

        if let Some(ss) = rd.ss() {
            let (leader_id, role) = (ss.leader_id, ss.raft_state);
            self.on_soft_state(leader_id, role);
        }

        // Leaders may send before persisting.
        for m in rd.take_messages() {
            self.send(m).await;
        }

        if !rd.snapshot().is_empty() {
            self.install_snapshot(rd.snapshot())?;
        }

        let committed = rd.take_committed_entries();
        self.apply_entries(committed)?;

        if !rd.entries().is_empty() {
            self.log.append(rd.entries()).map_err(log_err)?;
        }
        if let Some(hs) = rd.hs() {
            self.log.set_hard_state(hs).map_err(log_err)?;
            self.state.set(self.rn.raft.leader_id, hs.term);
        }

        // Send persisted_messages only after persistence
        for m in rd.take_persisted_messages() {
            self.send(m).await;
        }

        let mut light_rd = self.rn.advance(rd);
        if let Some(commit) = light_rd.commit_index() {
            self.log.set_commit(commit).map_err(log_err)?;
        }
        for m in light_rd.take_messages() {
            self.send(m).await;
        }
        let committed = light_rd.take_committed_entries();
        self.apply_entries(committed)?;
        self.rn.advance_apply();
        Ok(())
    }

    async fn send(&self, m: RaftMessage) {
        if let Err(e) = self.transport.send(m).await {
            tracing::debug!("raft transport: {:#}", e);
        }
    }

    /// Handlers hear about a new leader before `wait_for_leader` callers do.
    fn on_soft_state(&mut self, leader_id: u64, role: StateRole) {
        let term = self.rn.raft.term;
        if (leader_id, role) != self.last_soft {
            let was_leader = self.last_soft.1 == StateRole::Leader;
            self.last_soft = (leader_id, role);
            tracing::info!(
                "raft role changed: leader={} role={:?} term={}",
                leader_id,
                role,
                term
            );
            if was_leader && role != StateRole::Leader {
                for (_, p) in self.pending.drain() {
                    p.fail(Error::NotLeader { leader: None });
                }
            }
            self.sm.handle_leader_change(LeaderChange { leader_id, term });
        }
        self.state.set(leader_id, term);
    }

    fn install_snapshot(&mut self, snap: &Snapshot) -> Result<()> {
        let meta = snap.get_metadata();
        tracing::info!(
            "installing snapshot index={} term={}",
            meta.get_index(),
            meta.get_term()
        );
        self.sm.apply_snapshot(snap.get_data())?;
        self.log.apply_snapshot_meta(meta).map_err(log_err)?;
        Ok(())
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        for ent in entries {
            match ent.get_entry_type() {
                EntryType::EntryNormal => self.apply_normal(&ent)?,
                EntryType::EntryConfChange => self.apply_conf_change(&ent)?,
                EntryType::EntryConfChangeV2 => self.apply_conf_change_v2(&ent)?,
            }
            self.maybe_compact(ent.index)?;
        }
        Ok(())
    }

    fn local_seq(&self, ctx: &[u8]) -> Option<u64> {
        decode_ctx(ctx)
            .filter(|(node, _)| *node == self.node_id)
            .map(|(_, seq)| seq)
    }

    fn apply_normal(&mut self, ent: &Entry) -> Result<()> {
        let applied = self.sm.apply(ent.index, ent.get_data())?;
        if let Some(seq) = self.local_seq(ent.get_context()) {
            match self.pending.remove(&seq) {
                Some(Pending::Command(tx)) => {
                    let _ = tx.send(applied.result);
                }
                Some(other) => other.fail(Error::Internal("proposal kind mismatch".into())),
                None => {}
            }
        }
        Ok(())
    }

    fn apply_conf_change(&mut self, ent: &Entry) -> Result<()> {
        if ent.get_data().is_empty() {
            self.sm.apply(ent.index, &[])?;
            return Ok(());
        }
        let mut cc = ConfChange::default();
        cc.merge_from_bytes(ent.get_data())
            .map_err(|e| Error::Serialization(format!("conf change: {e}")))?;
        let cs = self.rn.apply_conf_change(&cc).map_err(raft_err)?;
        self.log.set_conf_state(&cs).map_err(log_err)?;

        let addr = String::from_utf8_lossy(cc.get_context()).into_owned();
        let kind = match cc.get_change_type() {
            ConfChangeType::RemoveNode => PeerChangeKind::Remove,
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => PeerChangeKind::Add,
        };
        match kind {
            PeerChangeKind::Add => {
                if let Some((host, _)) = split_host_port(&addr) {
                    self.transport.peers().upsert(cc.node_id, host);
                }
            }
            PeerChangeKind::Remove => {
                self.transport.peers().remove(cc.node_id);
                self.transport.forget(cc.node_id);
            }
        }

        let change = PeerChange {
            kind,
            id: cc.node_id,
            addr,
        };
        self.sm.apply_member_change(ent.index, &change)?;

        if let Some(seq) = self.local_seq(ent.get_context()) {
            match self.pending.remove(&seq) {
                Some(Pending::Member(tx)) => {
                    let _ = tx.send(Ok(()));
                }
                Some(other) => other.fail(Error::Internal("proposal kind mismatch".into())),
                None => {}
            }
        }
        Ok(())
    }

    /// Joint-consensus entries are applied to raft but carry no peer addresses.
    fn apply_conf_change_v2(&mut self, ent: &Entry) -> Result<()> {
        if !ent.get_data().is_empty() {
            let mut cc = ConfChangeV2::default();
            cc.merge_from_bytes(ent.get_data())
                .map_err(|e| Error::Serialization(format!("conf change v2: {e}")))?;
            let cs = self.rn.apply_conf_change(&cc).map_err(raft_err)?;
            self.log.set_conf_state(&cs).map_err(log_err)?;
        }
        self.sm.apply(ent.index, &[])?;
        Ok(())
    }

    /// Truncate the log on every multiple of the retention count.
    fn maybe_compact(&self, index: u64) -> Result<()> {
        let retain = self.sm.retain_logs();
        if index == 0 || index % retain != 0 {
            return Ok(());
        }
        self.log.compact_to(index + 1).map_err(log_err)?;
        tracing::info!("raft log truncated through {}", index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_roundtrip_and_rejects_foreign_lengths() {
        let ctx = encode_ctx(3, u64::MAX - 1);
        assert_eq!(decode_ctx(&ctx), Some((3, u64::MAX - 1)));
        assert_eq!(decode_ctx(&[]), None);
        assert_eq!(decode_ctx(&[0; 15]), None);
    }
}
