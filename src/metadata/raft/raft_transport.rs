use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use protobuf::Message as ProtobufMessage; // Import the trait for write_to_bytes
use raft::prelude::Message as RaftMessage;
use raft::prelude::MessageType;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};

use crate::master::RaftPacket;
use crate::master::raft_transport_client::RaftTransportClient;
use crate::master::raft_transport_server::RaftTransport;

const PEER_QUEUE_DEPTH: usize = 1024;

/// Raft routing table: peer id to host. The raft ports are shared cluster-wide.
#[derive(Clone, Default)]
pub struct PeerStore {
    map: Arc<RwLock<HashMap<u64, String>>>,
}

impl PeerStore {
    pub fn new(initial: Vec<(u64, String)>) -> Self {
        Self {
            map: Arc::new(RwLock::new(initial.into_iter().collect())),
        }
    }

    pub fn resolve(&self, id: u64) -> Option<String> {
        self.map.read().get(&id).cloned()
    }

    pub fn upsert(&self, id: u64, host: String) {
        self.map.write().insert(id, host);
    }

    pub fn remove(&self, id: u64) {
        self.map.write().remove(&id);
    }
}

/// A delivery failure the raft loop should report back to the engine.
#[derive(Debug, Clone, Copy)]
pub struct Unreachable {
    pub to: u64,
    pub snapshot: bool,
}

/// Interface that delivers Raft messages to other nodes
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, msg: RaftMessage) -> Result<()>;
}

#[derive(Clone)]
pub struct TransportConfig {
    pub group_id: u64,
    pub heartbeat_port: u16,
    pub replica_port: u16,
    pub connect_timeout: Duration,
}

/// Sends raft traffic over gRPC. Heartbeats go to the heartbeat port,
/// everything else to the replica port. Each peer has its own queue and
/// sender task so a dead peer never stalls the raft loop.
pub struct GrpcTransport {
    self_id: u64,
    cfg: TransportConfig,
    peers: PeerStore,
    loopback_tx: mpsc::Sender<RaftMessage>,
    report_tx: mpsc::UnboundedSender<Unreachable>,
    queues: Mutex<HashMap<u64, mpsc::Sender<RaftMessage>>>,
}

impl GrpcTransport {
    pub fn new(
        self_id: u64,
        cfg: TransportConfig,
        peers: PeerStore,
        loopback_tx: mpsc::Sender<RaftMessage>,
        report_tx: mpsc::UnboundedSender<Unreachable>,
    ) -> Self {
        Self {
            self_id,
            cfg,
            peers,
            loopback_tx,
            report_tx,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn peers(&self) -> &PeerStore {
        &self.peers
    }

    /// Drop the queue of a removed peer; its sender task exits once drained.
    pub fn forget(&self, id: u64) {
        self.queues.lock().remove(&id);
    }

    fn queue(&self, to: u64) -> mpsc::Sender<RaftMessage> {
        let mut queues = self.queues.lock();
        if let Some(tx) = queues.get(&to).filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        let sender = PeerSender {
            to,
            cfg: self.cfg.clone(),
            peers: self.peers.clone(),
            report_tx: self.report_tx.clone(),
            heartbeat: None,
            replica: None,
        };
        tokio::spawn(sender.run(rx));
        queues.insert(to, tx.clone());
        tx
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn send(&self, msg: RaftMessage) -> Result<()> {
        let to = msg.get_to();
        // Self-targeted messages take the loopback fast path
        if to == self.self_id {
            self.loopback_tx
                .try_send(msg)
                .map_err(|e| anyhow::anyhow!("loopback: {}", e))?;
            return Ok(());
        }
        let snapshot = msg.get_msg_type() == MessageType::MsgSnapshot;
        if let Err(e) = self.queue(to).try_send(msg) {
            tracing::debug!("raft queue to {} rejected message: {}", to, e);
            let _ = self.report_tx.send(Unreachable { to, snapshot });
        }
        Ok(())
    }
}

fn is_heartbeat(msg: &RaftMessage) -> bool {
    matches!(
        msg.get_msg_type(),
        MessageType::MsgHeartbeat | MessageType::MsgHeartbeatResponse
    )
}

struct PeerSender {
    to: u64,
    cfg: TransportConfig,
    peers: PeerStore,
    report_tx: mpsc::UnboundedSender<Unreachable>,
    heartbeat: Option<RaftTransportClient<Channel>>,
    replica: Option<RaftTransportClient<Channel>>,
}

impl PeerSender {
    async fn run(mut self, mut rx: mpsc::Receiver<RaftMessage>) {
        while let Some(msg) = rx.recv().await {
            let heartbeat = is_heartbeat(&msg);
            let snapshot = msg.get_msg_type() == MessageType::MsgSnapshot;
            if let Err(e) = self.deliver(msg, heartbeat).await {
                tracing::debug!("raft send to {} failed: {:#}", self.to, e);
                if heartbeat {
                    self.heartbeat = None;
                } else {
                    self.replica = None;
                }
                let _ = self.report_tx.send(Unreachable {
                    to: self.to,
                    snapshot,
                });
            }
        }
        tracing::debug!("raft sender for peer {} stopped", self.to);
    }

    async fn deliver(&mut self, msg: RaftMessage, heartbeat: bool) -> Result<()> {
        let data = msg.write_to_bytes()?;
        let mut client = self.client(heartbeat).await?;
        client
            .send(Request::new(RaftPacket {
                group_id: self.cfg.group_id,
                data,
            }))
            .await
            .map_err(|e| anyhow::anyhow!("gRPC send: {}", e))?;
        Ok(())
    }

    async fn client(&mut self, heartbeat: bool) -> Result<RaftTransportClient<Channel>> {
        let slot = if heartbeat {
            &mut self.heartbeat
        } else {
            &mut self.replica
        };
        if let Some(c) = slot.as_ref() {
            return Ok(c.clone());
        }
        let host = self
            .peers
            .resolve(self.to)
            .ok_or_else(|| anyhow::anyhow!("no route to id={}", self.to))?;
        let port = if heartbeat {
            self.cfg.heartbeat_port
        } else {
            self.cfg.replica_port
        };
        // Establish tonic Channel (needs http://)
        let ch = Endpoint::from_shared(format!("http://{host}:{port}"))?
            .connect_timeout(self.cfg.connect_timeout)
            .timeout(self.cfg.connect_timeout * 4)
            .connect()
            .await?;
        let client = RaftTransportClient::new(ch).max_encoding_message_size(MAX_RAFT_PACKET);
        *slot = Some(client.clone());
        Ok(client)
    }
}

pub const MAX_RAFT_PACKET: usize = 64 * 1024 * 1024;

/// Inbound side: routes packets to the raft loop of their group.
#[derive(Clone, Default)]
pub struct RaftService {
    groups: Arc<RwLock<HashMap<u64, mpsc::Sender<RaftMessage>>>>,
}

impl RaftService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the group already has a route.
    pub fn register(&self, group_id: u64, tx: mpsc::Sender<RaftMessage>) -> bool {
        let mut groups = self.groups.write();
        if groups.contains_key(&group_id) {
            return false;
        }
        groups.insert(group_id, tx);
        true
    }

    pub fn unregister(&self, group_id: u64) {
        self.groups.write().remove(&group_id);
    }

    pub fn contains(&self, group_id: u64) -> bool {
        self.groups.read().contains_key(&group_id)
    }
}

#[tonic::async_trait]
impl RaftTransport for RaftService {
    async fn send(&self, req: Request<RaftPacket>) -> std::result::Result<Response<()>, Status> {
        let packet = req.into_inner();
        let msg = RaftMessage::parse_from_bytes(&packet.data)
            .map_err(|_| Status::invalid_argument("decode raft message"))?;
        let tx = self
            .groups
            .read()
            .get(&packet.group_id)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("unknown group {}", packet.group_id)))?;
        tx.try_send(msg)
            .map_err(|_| Status::unavailable("node busy/dropped"))?;
        Ok(Response::new(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(to: u64, kind: MessageType) -> RaftMessage {
        let mut m = RaftMessage::default();
        m.to = to;
        m.from = 1;
        m.set_msg_type(kind);
        m
    }

    #[test]
    fn test_heartbeats_are_classified() {
        assert!(is_heartbeat(&message(2, MessageType::MsgHeartbeat)));
        assert!(is_heartbeat(&message(2, MessageType::MsgHeartbeatResponse)));
        assert!(!is_heartbeat(&message(2, MessageType::MsgAppend)));
        assert!(!is_heartbeat(&message(2, MessageType::MsgSnapshot)));
    }

    #[tokio::test]
    async fn test_loopback_and_unreachable_peer() {
        let (loop_tx, mut loop_rx) = mpsc::channel(8);
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let transport = GrpcTransport::new(
            1,
            TransportConfig {
                group_id: 1,
                // nothing listens on port 1
                heartbeat_port: 1,
                replica_port: 1,
                connect_timeout: Duration::from_millis(200),
            },
            PeerStore::new(vec![(2, "127.0.0.1".to_string())]),
            loop_tx,
            report_tx,
        );

        transport
            .send(message(1, MessageType::MsgAppend))
            .await
            .unwrap();
        assert_eq!(loop_rx.recv().await.unwrap().get_to(), 1);

        transport
            .send(message(2, MessageType::MsgAppend))
            .await
            .unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), report_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.to, 2);
        assert!(!report.snapshot);
    }

    #[tokio::test]
    async fn test_service_routes_by_group() {
        let service = RaftService::new();
        let (tx, mut rx) = mpsc::channel(4);
        assert!(service.register(1, tx.clone()));
        assert!(!service.register(1, tx));

        let data = message(1, MessageType::MsgHeartbeat).write_to_bytes().unwrap();
        service
            .send(Request::new(RaftPacket {
                group_id: 1,
                data: data.clone(),
            }))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap().get_msg_type(),
            MessageType::MsgHeartbeat
        );

        let err = service
            .send(Request::new(RaftPacket { group_id: 9, data }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }
}
