//! Data/meta node bookkeeping.
//!
//! Registration and status changes are replicated commands. Heartbeats are
//! only recorded in the leader's memory; the leader-only liveness task turns
//! a missing heartbeat into an `UpdateNodeStatus` proposal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prost::Message;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::common::{ClusterPolicy, Error, Result, unix_millis};
use crate::master::{
    MetaCmd, NodeInfo, NodeKind, RegisterNode, RemoveNode, UpdateNodeStatus, meta_cmd::Op,
};
use crate::metadata::MetadataFsm;
use crate::metadata::handler::{CommandOutput, Mutation, StoreReader};
use crate::metadata::raft::raft_store::Partition;
use crate::metadata::utils::{MAX_NODE_ID_KEY, NODE_PREFIX, be_to_u64, kv_node_key, u64be_bytes};

const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct Cluster {
    name: String,
    policy: ClusterPolicy,
    sm: Arc<MetadataFsm>,
    partition: Partition,
    heartbeats: Arc<Mutex<HashMap<u64, Instant>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    pub fn new(
        name: String,
        policy: ClusterPolicy,
        sm: Arc<MetadataFsm>,
        partition: Partition,
    ) -> Self {
        Self {
            name,
            policy,
            sm,
            partition,
            heartbeats: Arc::new(Mutex::new(HashMap::new())),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn register_node(
        &self,
        addr: &str,
        zone: &str,
        kind: NodeKind,
        total_bytes: u64,
    ) -> Result<NodeInfo> {
        if addr.is_empty() {
            return Err(Error::InvalidArgument("node address is empty".into()));
        }
        if kind == NodeKind::Unspecified {
            return Err(Error::InvalidArgument("node kind is unspecified".into()));
        }
        let cmd = MetaCmd {
            op: Some(Op::RegisterNode(RegisterNode {
                addr: addr.to_string(),
                zone: zone.to_string(),
                kind: kind as i32,
                total_bytes,
                register_time: unix_millis(),
                node_set_capacity: self.policy.node_set_capacity as u64,
            })),
        };
        let reply = self.partition.submit(&cmd).await?;
        let node = NodeInfo::decode(reply.as_slice())?;
        self.heartbeats.lock().insert(node.id, Instant::now());
        tracing::info!(
            "registered {:?} node {} at {} (zone {}, node set {})",
            node.kind(),
            node.id,
            node.addr,
            node.zone,
            node.node_set_id
        );
        Ok(node)
    }

    /// Record a heartbeat; an inactive node is reactivated through a proposal.
    pub async fn heartbeat(&self, id: u64) -> Result<()> {
        let node = self.get_node(id)?;
        self.heartbeats.lock().insert(id, Instant::now());
        if !node.active {
            self.set_active(id, true).await?;
            tracing::info!("node {} is back", id);
        }
        Ok(())
    }

    pub async fn remove_node(&self, id: u64) -> Result<()> {
        self.get_node(id)?;
        let cmd = MetaCmd {
            op: Some(Op::RemoveNode(RemoveNode { id })),
        };
        self.partition.submit(&cmd).await?;
        self.heartbeats.lock().remove(&id);
        tracing::info!("removed node {}", id);
        Ok(())
    }

    pub fn get_node(&self, id: u64) -> Result<NodeInfo> {
        let raw = self
            .sm
            .get(&kv_node_key(id))?
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
        Ok(NodeInfo::decode(raw.as_slice())?)
    }

    pub fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        load_nodes(self.sm.as_ref())
    }

    async fn set_active(&self, id: u64, active: bool) -> Result<()> {
        let cmd = MetaCmd {
            op: Some(Op::UpdateNodeStatus(UpdateNodeStatus { id, active })),
        };
        self.partition.submit(&cmd).await.map(|_| ())
    }

    /// Start the leader-only background work. Calling it twice is harmless.
    pub fn start_scheduling(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        // Every known node gets a full timeout from the moment we took over.
        let now = Instant::now();
        match self.list_nodes() {
            Ok(nodes) => {
                let mut heartbeats = self.heartbeats.lock();
                for n in nodes {
                    heartbeats.insert(n.id, now);
                }
            }
            Err(e) => tracing::warn!("cluster {}: cannot load nodes: {}", self.name, e),
        }
        let timeout = self.policy.data_partition_timeout;
        let interval = (timeout / 4).max(MIN_CHECK_INTERVAL);
        let cluster = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !cluster.partition.is_leader() {
                    continue;
                }
                if let Err(e) = cluster.check_liveness(timeout).await {
                    tracing::warn!("cluster {}: liveness check failed: {}", cluster.name, e);
                }
            }
        }));
        tracing::info!("cluster {}: background scheduling started", self.name);
    }

    pub fn stop_scheduling(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::info!("cluster {}: background scheduling stopped", self.name);
        }
    }

    /// Stop scheduling and wait until the task is gone.
    pub async fn join_scheduling(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            tracing::info!("cluster {}: background scheduling stopped", self.name);
        }
    }

    pub fn is_scheduling(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    async fn check_liveness(&self, timeout: Duration) -> Result<()> {
        let stale: Vec<u64> = {
            let heartbeats = self.heartbeats.lock();
            self.list_nodes()?
                .into_iter()
                .filter(|n| n.active)
                .filter(|n| heartbeats.get(&n.id).map_or(true, |t| t.elapsed() > timeout))
                .map(|n| n.id)
                .collect()
        };
        for id in stale {
            tracing::warn!("node {} missed heartbeats for {:?}, marking inactive", id, timeout);
            self.set_active(id, false).await?;
        }
        Ok(())
    }

    /// Forget heartbeats of nodes that vanished with an installed snapshot.
    pub fn on_snapshot_applied(&self) {
        let Ok(nodes) = self.list_nodes() else {
            return;
        };
        let ids: Vec<u64> = nodes.iter().map(|n| n.id).collect();
        self.heartbeats.lock().retain(|id, _| ids.contains(id));
    }
}

fn load_nodes(store: &dyn StoreReader) -> Result<Vec<NodeInfo>> {
    store
        .scan_prefix(NODE_PREFIX)?
        .into_iter()
        .map(|(_, v)| Ok(NodeInfo::decode(v.as_slice())?))
        .collect()
}

fn load_node(store: &dyn StoreReader, id: u64) -> Result<NodeInfo> {
    let raw = store
        .get(&kv_node_key(id))?
        .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
    Ok(NodeInfo::decode(raw.as_slice())?)
}

/// Register a node, or return the existing record for a known address.
pub(crate) fn apply_register_node(cmd: &RegisterNode, store: &dyn StoreReader) -> Result<CommandOutput> {
    let nodes = load_nodes(store)?;
    if let Some(existing) = nodes.iter().find(|n| n.addr == cmd.addr) {
        return Ok(CommandOutput {
            mutations: Vec::new(),
            response: existing.encode_to_vec(),
        });
    }

    let max_id = match store.get(MAX_NODE_ID_KEY)? {
        Some(raw) => be_to_u64(&raw)
            .ok_or_else(|| Error::StoreIo("corrupt max node id".into()))?,
        None => 0,
    };
    let id = max_id + 1;

    // Fill the newest set of the zone, open a new one when it is full.
    let mut sets: HashMap<u64, usize> = HashMap::new();
    for n in nodes.iter().filter(|n| n.zone == cmd.zone && n.kind == cmd.kind) {
        *sets.entry(n.node_set_id).or_default() += 1;
    }
    let capacity = cmd.node_set_capacity.max(1) as usize;
    let node_set_id = match sets.iter().max_by_key(|(set, _)| **set) {
        Some((set, members)) if *members < capacity => *set,
        _ => nodes.iter().map(|n| n.node_set_id).max().unwrap_or(0) + 1,
    };

    let node = NodeInfo {
        id,
        addr: cmd.addr.clone(),
        zone: cmd.zone.clone(),
        kind: cmd.kind,
        active: true,
        node_set_id,
        total_bytes: cmd.total_bytes,
        register_time: cmd.register_time,
    };
    let value = node.encode_to_vec();
    Ok(CommandOutput {
        mutations: vec![
            Mutation::put(kv_node_key(id), value.clone()),
            Mutation::put(MAX_NODE_ID_KEY, u64be_bytes(id)),
        ],
        response: value,
    })
}

pub(crate) fn apply_update_node_status(
    cmd: &UpdateNodeStatus,
    store: &dyn StoreReader,
) -> Result<CommandOutput> {
    let mut node = load_node(store, cmd.id)?;
    node.active = cmd.active;
    Ok(CommandOutput {
        mutations: vec![Mutation::put(kv_node_key(cmd.id), node.encode_to_vec())],
        response: Vec::new(),
    })
}

pub(crate) fn apply_remove_node(cmd: &RemoveNode, store: &dyn StoreReader) -> Result<CommandOutput> {
    load_node(store, cmd.id)?;
    Ok(CommandOutput {
        mutations: vec![Mutation::delete(kv_node_key(cmd.id))],
        response: Vec::new(),
    })
}
