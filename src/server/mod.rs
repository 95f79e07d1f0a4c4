//! Master bootstrap and lifecycle.
//!
//! [`Server::start`] wires the metadata store, the state machine, the
//! consensus partition and the domain subsystems together and serves the
//! management API. Each step only runs after the previous one succeeded; a
//! failure tears down what was already started.

pub mod api;
pub mod cluster;
pub mod command;
pub mod coordinator;
pub mod user;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;

use crate::common::{ClusterConfig, Error, RawConfig, Result};
use crate::metadata::MetadataFsm;
use crate::metadata::raft::raft_store::{GROUP_ID, Partition, PartitionConfig, RaftStore};
use crate::metadata::rocks::{LRU_CACHE_SIZE, RocksDbStore, WRITE_BUFFER_SIZE};

use self::api::MasterApiService;
use self::cluster::Cluster;
use self::command::CommandRouter;
use self::coordinator::Coordinator;
use self::user::UserManager;

pub struct Server {
    config: ClusterConfig,
    sm: Arc<MetadataFsm>,
    raft_store: RaftStore,
    partition: Partition,
    coordinator: Arc<Coordinator>,
    cluster: Arc<Cluster>,
    users: Arc<UserManager>,
    api_addr: SocketAddr,
    api_shutdown: watch::Sender<bool>,
    api_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    done: watch::Sender<bool>,
}

impl Server {
    pub async fn start(raw: &RawConfig) -> Result<Self> {
        let config = ClusterConfig::validate(raw)?;
        tracing::info!(
            "starting master {} of cluster {}",
            config.node_id,
            config.cluster_name
        );

        let store = RocksDbStore::open(&config.store_dir, LRU_CACHE_SIZE, WRITE_BUFFER_SIZE)?;
        let sm = Arc::new(MetadataFsm::new(store, config.retain_logs));
        let coordinator = Arc::new(Coordinator::new(config.node_id, &config.peers));
        sm.register_leader_change_handler(coordinator.clone())?;
        sm.register_peer_change_handler(coordinator.clone())?;
        sm.register_apply_snapshot_handler(coordinator.clone())?;
        sm.register_user_command_handler(Arc::new(CommandRouter))?;
        let applied = sm.restore()?;

        let raft_store = match RaftStore::new(&config).await {
            Ok(rs) => rs,
            Err(e) => {
                close_quietly(&sm);
                return Err(e);
            }
        };
        let partition = match raft_store.create_partition(PartitionConfig {
            id: GROUP_ID,
            peers: config.peers.clone(),
            applied,
            sm: sm.clone(),
        }) {
            Ok(p) => p,
            Err(e) => {
                teardown(&raft_store, None, &sm).await;
                return Err(e);
            }
        };
        match partition.wait_for_leader(config.startup_timeout).await {
            Ok(status) => tracing::info!(
                "metadata partition {} has leader {} at term {}",
                GROUP_ID,
                status.leader_id,
                status.term
            ),
            Err(e) => {
                teardown(&raft_store, Some(&partition), &sm).await;
                return Err(e);
            }
        }

        let cluster = Arc::new(Cluster::new(
            config.cluster_name.clone(),
            config.policy.clone(),
            sm.clone(),
            partition.clone(),
        ));
        let users = Arc::new(UserManager::new(sm.clone(), partition.clone()));
        coordinator.attach_cluster(&cluster)?;

        let listener = match TcpListener::bind(config.api_addr()).await {
            Ok(l) => l,
            Err(e) => {
                cluster.join_scheduling().await;
                teardown(&raft_store, Some(&partition), &sm).await;
                return Err(Error::Io(e));
            }
        };
        let api_addr = listener.local_addr()?;
        let (api_shutdown, mut shutdown_rx) = watch::channel(false);
        let svc = MasterApiService::new(
            coordinator.clone(),
            cluster.clone(),
            users.clone(),
            partition.clone(),
        )
        .into_server();
        let api_task = tokio::spawn(async move {
            let res = tonic::transport::Server::builder()
                .add_service(svc)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await;
            if let Err(e) = res {
                tracing::error!("management api stopped: {}", e);
            }
        });
        tracing::info!("management api listening on {}", api_addr);

        let (done, _) = watch::channel(false);
        Ok(Self {
            config,
            sm,
            raft_store,
            partition,
            coordinator,
            cluster,
            users,
            api_addr,
            api_shutdown,
            api_task: Mutex::new(Some(api_task)),
            stopped: AtomicBool::new(false),
            done,
        })
    }

    /// Stop everything in reverse start order. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down master {}", self.config.node_id);

        let _ = self.api_shutdown.send(true);
        let api_task = self.api_task.lock().take();
        if let Some(task) = api_task {
            let _ = task.await;
        }
        self.cluster.join_scheduling().await;
        teardown(&self.raft_store, Some(&self.partition), &self.sm).await;

        let _ = self.done.send(true);
        tracing::info!("master {} stopped", self.config.node_id);
    }

    /// Resolves after [`Server::shutdown`] or when the consensus loop dies.
    pub async fn sync(&self) {
        let mut done = self.done.subscribe();
        tokio::select! {
            _ = async { let _ = done.wait_for(|d| *d).await; } => {}
            _ = self.partition.exited() => {
                if !self.stopped.load(Ordering::SeqCst) {
                    tracing::error!("metadata partition {} exited unexpectedly", GROUP_ID);
                }
            }
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Address the management API actually listens on.
    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn state_machine(&self) -> &Arc<MetadataFsm> {
        &self.sm
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn users(&self) -> &Arc<UserManager> {
        &self.users
    }
}

async fn teardown(raft_store: &RaftStore, partition: Option<&Partition>, sm: &MetadataFsm) {
    if let Some(partition) = partition {
        if let Err(e) = partition.stop().await {
            tracing::warn!("stop partition {}: {}", partition.group_id(), e);
        }
    }
    raft_store.stop().await;
    close_quietly(sm);
}

fn close_quietly(sm: &MetadataFsm) {
    if let Err(e) = sm.close() {
        tracing::warn!("close state machine: {}", e);
    }
}
