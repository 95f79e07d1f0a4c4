use std::path::Path;
use std::time::Duration;

use pillar_master::common::{
    Error, KEY_CLUSTER_NAME, KEY_ELECTION_TICK, KEY_HEARTBEAT_PORT, KEY_ID, KEY_IP, KEY_PEERS,
    KEY_PORT, KEY_REPLICA_PORT, KEY_STARTUP_TIMEOUT, KEY_STORE_DIR, KEY_TICK_INTERVAL,
    KEY_WAL_DIR, RawConfig,
};
use pillar_master::master::master_api_client::MasterApiClient;
use pillar_master::master::{
    CreateUserRequest, GetLeaderRequest, GetUserRequest, ListNodesRequest, NodeKind,
    RegisterNodeRequest,
};
use pillar_master::metadata::{MetadataFsm, RocksDbStore};
use pillar_master::server::Server;

fn raw_config(dir: &Path, port: u16, peers: &str) -> RawConfig {
    RawConfig::new()
        .with(KEY_ID, "1")
        .with(KEY_CLUSTER_NAME, "it-cluster")
        .with(KEY_IP, "127.0.0.1")
        .with(KEY_PORT, port.to_string())
        .with(KEY_HEARTBEAT_PORT, (port + 1).to_string())
        .with(KEY_REPLICA_PORT, (port + 2).to_string())
        .with(KEY_WAL_DIR, dir.join("wal").display().to_string())
        .with(KEY_STORE_DIR, dir.join("store").display().to_string())
        .with(KEY_TICK_INTERVAL, "301")
        .with(KEY_ELECTION_TICK, "4")
        .with(KEY_PEERS, peers)
}

async fn client(server: &Server) -> MasterApiClient<tonic::transport::Channel> {
    MasterApiClient::connect(format!("http://{}", server.api_addr()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_single_node_serves_management_api() {
    let dir = tempfile::tempdir().unwrap();
    let raw = raw_config(dir.path(), 28110, "1@127.0.0.1:28110");
    let server = Server::start(&raw).await.unwrap();
    assert!(server.coordinator().is_ready());
    assert!(server.cluster().is_scheduling());

    let mut api = client(&server).await;
    let leader = api.get_leader(GetLeaderRequest {}).await.unwrap().into_inner();
    assert_eq!(leader.leader_id, 1);
    assert!(leader.is_self);
    assert_eq!(leader.leader_addr, "127.0.0.1:28110");

    let alice = api
        .create_user(CreateUserRequest {
            user_id: "alice".into(),
            description: "first".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(alice.user_id, "alice");
    assert!(!alice.secret_key.is_empty());

    let dup = api
        .create_user(CreateUserRequest {
            user_id: "alice".into(),
            description: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(dup.code(), tonic::Code::AlreadyExists);

    let bad = api
        .create_user(CreateUserRequest {
            user_id: "no spaces".into(),
            description: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(bad.code(), tonic::Code::InvalidArgument);

    let fetched = api
        .get_user(GetUserRequest {
            user_id: "alice".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(fetched, alice);

    let node = api
        .register_node(RegisterNodeRequest {
            addr: "10.1.0.1:17310".into(),
            zone: "z1".into(),
            kind: NodeKind::Data as i32,
            total_bytes: 1 << 40,
        })
        .await
        .unwrap()
        .into_inner();
    let nodes = api.list_nodes(ListNodesRequest {}).await.unwrap().into_inner().nodes;
    assert_eq!(nodes, vec![node]);

    drop(api);
    server.shutdown().await;
    server.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), server.sync())
        .await
        .unwrap();
    assert!(matches!(
        server.users().create_user("bob", "").await,
        Err(Error::NotLeader { .. }) | Err(Error::Closed)
    ));
}

#[tokio::test]
async fn test_restart_restores_metadata() {
    let dir = tempfile::tempdir().unwrap();

    let server = Server::start(&raw_config(dir.path(), 28120, "1@127.0.0.1:28120"))
        .await
        .unwrap();
    server.users().create_user("carol", "ops").await.unwrap();
    server.shutdown().await;
    let applied = server.state_machine().applied_index();
    assert!(applied > 0);
    drop(server);

    // what a fresh process would recover before consensus starts
    {
        let store = RocksDbStore::open(dir.path().join("store"), 8 << 20, 4 << 20).unwrap();
        let sm = MetadataFsm::new(store, 20000);
        assert_eq!(sm.restore().unwrap(), applied);
    }

    let server = Server::start(&raw_config(dir.path(), 28130, "1@127.0.0.1:28130"))
        .await
        .unwrap();
    assert!(server.state_machine().applied_index() >= applied);
    let carol = server.users().get_user("carol").unwrap();
    assert_eq!(carol.description, "ops");
    assert_eq!(server.users().list_users().unwrap().len(), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_quorum_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let raw = raw_config(
        dir.path(),
        28140,
        "1@127.0.0.1:28140,2@127.0.0.2:28150,3@127.0.0.3:28160",
    )
    .with(KEY_STARTUP_TIMEOUT, "2");

    match Server::start(&raw).await {
        Err(e @ Error::ConsensusInit(_)) => assert!(e.is_fatal()),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("started without a quorum"),
    }
}

#[tokio::test]
async fn test_invalid_config_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let raw = raw_config(dir.path(), 28170, "1@127.0.0.1:28170").with(KEY_ID, "abc");
    match Server::start(&raw).await {
        Err(e @ Error::InvalidConfig(_)) => assert!(e.is_fatal()),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("started with a bad node id"),
    }
    assert!(!dir.path().join("store").exists());
}
