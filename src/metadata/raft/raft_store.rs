//! Consensus partition binding.
//!
//! [`RaftStore`] owns the raft listeners of this process and creates
//! replication groups on top of them. [`Partition`] is the handle through
//! which domain logic proposes commands and membership changes.

use parking_lot::Mutex;
use raft::default_logger;
use raft::prelude::{ConfChange, ConfChangeType, ConfState, Config};
use raft::RawNode;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::common::{ClusterConfig, Error, PeerAddr, Result};
use crate::master::MetaCmd;
use crate::master::raft_transport_server::RaftTransportServer;
use crate::metadata::fsm::MetadataFsm;
use crate::metadata::raft::cluster::{RaftClusterState, RaftStatus};
use crate::metadata::raft::raft_node::{Proposal, RaftInbox, RaftNode};
use crate::metadata::raft::raft_transport::{
    GrpcTransport, MAX_RAFT_PACKET, PeerStore, RaftService, TransportConfig,
};
use crate::metadata::raft::rocks_store::{PartitionStorage, RaftLogStore};

/// Group id of the metadata partition.
pub const GROUP_ID: u64 = 1;

const PROPOSAL_QUEUE_DEPTH: usize = 1024;

/// What a replication group needs to start.
pub struct PartitionConfig {
    pub id: u64,
    pub peers: Vec<PeerAddr>,
    /// Resume point: last entry the state machine has incorporated.
    pub applied: u64,
    pub sm: Arc<MetadataFsm>,
}

/// Process-wide consensus engine: raft listeners plus the groups bound to them.
pub struct RaftStore {
    node_id: u64,
    wal_dir: PathBuf,
    tick_interval: Duration,
    election_tick: usize,
    recv_buf_size: usize,
    transport: TransportConfig,
    service: RaftService,
    shutdown_tx: watch::Sender<bool>,
    servers: Mutex<Vec<JoinHandle<()>>>,
}

impl RaftStore {
    /// Create the WAL root and bind the heartbeat and replica listeners.
    pub async fn new(cfg: &ClusterConfig) -> Result<Self> {
        std::fs::create_dir_all(&cfg.wal_dir).map_err(|e| {
            Error::ConsensusInit(format!("create wal dir {}: {e}", cfg.wal_dir.display()))
        })?;

        let service = RaftService::new();
        let (shutdown_tx, _) = watch::channel(false);
        let mut servers = Vec::new();
        for port in [cfg.heartbeat_port, cfg.replica_port] {
            let ip: IpAddr = cfg
                .ip
                .parse()
                .map_err(|e| Error::ConsensusInit(format!("raft listen {}:{port}: {e}", cfg.ip)))?;
            let addr = SocketAddr::new(ip, port);
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| Error::ConsensusInit(format!("bind raft port {addr}: {e}")))?;
            tracing::info!("raft listening on {}", addr);
            let mut shutdown_rx = shutdown_tx.subscribe();
            let svc = RaftTransportServer::new(service.clone())
                .max_decoding_message_size(MAX_RAFT_PACKET);
            servers.push(tokio::spawn(async move {
                let res = Server::builder()
                    .add_service(svc)
                    .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                        let _ = shutdown_rx.changed().await;
                    })
                    .await;
                if let Err(e) = res {
                    tracing::error!("raft listener {} stopped: {}", addr, e);
                }
            }));
        }

        Ok(Self {
            node_id: cfg.node_id,
            wal_dir: cfg.wal_dir.clone(),
            tick_interval: cfg.tick_interval,
            election_tick: cfg.election_tick,
            recv_buf_size: cfg.raft_recv_buf_size,
            transport: TransportConfig {
                group_id: GROUP_ID,
                heartbeat_port: cfg.heartbeat_port,
                replica_port: cfg.replica_port,
                connect_timeout: cfg.tick_interval * 2,
            },
            service,
            shutdown_tx,
            servers: Mutex::new(servers),
        })
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Start the raft loop of a new replication group.
    pub fn create_partition(&self, pc: PartitionConfig) -> Result<Partition> {
        validate_peers(self.node_id, &pc.peers)?;
        if self.service.contains(pc.id) {
            return Err(Error::ConsensusInit(format!("group {} already exists", pc.id)));
        }

        let log = RaftLogStore::open(self.wal_dir.join(format!("group_{}", pc.id)))
            .map_err(|e| Error::ConsensusInit(format!("{e:#}")))?;
        seed_voters(&log, &pc.peers)?;

        let hs = log
            .load_hard_state()
            .map_err(|e| Error::ConsensusInit(format!("{e:#}")))?
            .unwrap_or_default();
        let first = log
            .first_index_inner()
            .map_err(|e| Error::ConsensusInit(format!("{e:#}")))?;
        if pc.applied + 1 < first {
            return Err(Error::ConsensusInit(format!(
                "state machine at {} is behind the raft log start {}",
                pc.applied, first
            )));
        }
        // Entries past the persisted commit are replayed; apply skips them.
        let applied = pc.applied.min(hs.commit);

        let raft_cfg = Config {
            id: self.node_id,
            election_tick: self.election_tick,
            heartbeat_tick: 1,
            applied,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        raft_cfg
            .validate()
            .map_err(|e| Error::ConsensusInit(format!("raft config: {e}")))?;

        let storage = PartitionStorage::new(log, pc.sm.clone());
        let logger = default_logger();
        let rn = RawNode::new(&raft_cfg, storage, &logger)
            .map_err(|e| Error::ConsensusInit(format!("RawNode::new: {e}")))?;

        let (net_tx, net_rx) = mpsc::channel(self.recv_buf_size);
        let (prop_tx, prop_rx) = mpsc::channel(PROPOSAL_QUEUE_DEPTH);
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (exited_tx, exited_rx) = watch::channel(false);

        if !self.service.register(pc.id, net_tx.clone()) {
            return Err(Error::ConsensusInit(format!("group {} already exists", pc.id)));
        }

        let peers = PeerStore::new(pc.peers.iter().map(|p| (p.id, p.host.clone())).collect());
        let transport = GrpcTransport::new(
            self.node_id,
            TransportConfig {
                group_id: pc.id,
                ..self.transport.clone()
            },
            peers,
            net_tx,
            report_tx,
        );
        let state = Arc::new(RaftClusterState::new(self.node_id));
        let node = RaftNode::new(rn, pc.sm.clone(), transport, state.clone(), self.tick_interval);
        let inbox = RaftInbox {
            net_rx,
            prop_rx,
            report_rx,
            stop_rx,
        };

        let group_id = pc.id;
        let service = self.service.clone();
        let task = tokio::spawn(async move {
            let res = node.run(inbox).await;
            service.unregister(group_id);
            if let Err(e) = &res {
                tracing::error!("raft loop of group {} exited: {}", group_id, e);
            }
            let _ = exited_tx.send(true);
            res
        });

        tracing::info!(
            "created partition {} with peers {:?}, resuming after {}",
            group_id,
            pc.peers.iter().map(|p| p.id).collect::<Vec<_>>(),
            applied
        );
        Ok(Partition {
            inner: Arc::new(PartitionInner {
                group_id,
                node_id: self.node_id,
                prop_tx,
                state,
                sm: pc.sm,
                stop_tx,
                exited_rx,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    /// Stop the raft listeners. Partitions are stopped through their handles.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let servers: Vec<_> = self.servers.lock().drain(..).collect();
        for s in servers {
            let _ = s.await;
        }
    }
}

fn validate_peers(node_id: u64, peers: &[PeerAddr]) -> Result<()> {
    if peers.is_empty() {
        return Err(Error::ConsensusInit("empty peer set".into()));
    }
    let mut seen = HashSet::new();
    for p in peers {
        if p.id == 0 || !seen.insert(p.id) {
            return Err(Error::ConsensusInit(format!("malformed peer set at id {}", p.id)));
        }
    }
    if !seen.contains(&node_id) {
        return Err(Error::ConsensusInit(format!(
            "local node {node_id} is not in the peer set"
        )));
    }
    Ok(())
}

/// First boot: the configured peers form the initial voter set.
fn seed_voters(log: &RaftLogStore, peers: &[PeerAddr]) -> Result<()> {
    let existing = log
        .load_conf_state()
        .map_err(|e| Error::ConsensusInit(format!("{e:#}")))?;
    if existing.is_some_and(|cs| !cs.voters.is_empty()) {
        return Ok(());
    }
    let mut cs = ConfState::default();
    cs.voters = peers.iter().map(|p| p.id).collect();
    tracing::debug!("bootstrap: ConfState voters = {:?}", cs.voters);
    log.set_conf_state(&cs)
        .map_err(|e| Error::ConsensusInit(format!("{e:#}")))
}

struct PartitionInner {
    group_id: u64,
    node_id: u64,
    prop_tx: mpsc::Sender<Proposal>,
    state: Arc<RaftClusterState>,
    sm: Arc<MetadataFsm>,
    stop_tx: watch::Sender<bool>,
    exited_rx: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

/// Cloneable handle to a running replication group.
#[derive(Clone)]
pub struct Partition {
    inner: Arc<PartitionInner>,
}

impl Partition {
    pub fn group_id(&self) -> u64 {
        self.inner.group_id
    }

    pub fn node_id(&self) -> u64 {
        self.inner.node_id
    }

    pub fn applied_index(&self) -> u64 {
        self.inner.sm.applied_index()
    }

    pub fn status(&self) -> RaftStatus {
        self.inner.state.get()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.state.is_leader()
    }

    /// Propose `cmd` and wait for the apply result of that very entry.
    pub async fn submit(&self, cmd: &MetaCmd) -> Result<Vec<u8>> {
        if !self.is_leader() {
            return Err(Error::NotLeader { leader: None });
        }
        let (reply, rx) = oneshot::channel();
        let data = prost::Message::encode_to_vec(cmd);
        self.inner
            .prop_tx
            .send(Proposal::Command { data, reply })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Propose adding or removing a voter; `addr` is its management address.
    pub async fn change_member(&self, kind: ConfChangeType, id: u64, addr: &str) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader { leader: None });
        }
        let mut change = ConfChange::default();
        change.set_change_type(kind);
        change.node_id = id;
        change.context = addr.as_bytes().to_vec().into();
        let (reply, rx) = oneshot::channel();
        self.inner
            .prop_tx
            .send(Proposal::Member { change, reply })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// `ConsensusInit` when no leader shows up within `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<RaftStatus> {
        if self.inner.state.wait_for_leader(timeout).await {
            Ok(self.status())
        } else {
            Err(Error::ConsensusInit(format!(
                "no leader elected for group {} within {:?}",
                self.inner.group_id, timeout
            )))
        }
    }

    /// Resolves once the raft loop has exited for any reason.
    pub async fn exited(&self) {
        let mut rx = self.inner.exited_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub async fn stop(&self) -> Result<()> {
        let _ = self.inner.stop_tx.send(true);
        let task = self.inner.task.lock().take();
        match task {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Internal(format!("raft loop panicked: {e}")))?,
            None => Ok(()),
        }
    }
}
