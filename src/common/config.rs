//! Master configuration.
//!
//! The raw configuration is a flat key/value set (read from a TOML file);
//! [`ClusterConfig::validate`] turns it into the typed, defaulted value every
//! component receives by reference. Validation runs in two passes:
//!
//! 1. the *required* pass: missing identity/network/storage keys and
//!    unparsable values are fatal (`InvalidConfig`);
//! 2. the *floor* pass: tunables below their documented floor are replaced by
//!    the documented default.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use super::{Error, Result};

// configuration keys
pub const KEY_ID: &str = "id";
pub const KEY_CLUSTER_NAME: &str = "clusterName";
pub const KEY_IP: &str = "ip";
pub const KEY_PORT: &str = "port";
pub const KEY_WAL_DIR: &str = "walDir";
pub const KEY_STORE_DIR: &str = "storeDir";
pub const KEY_PEERS: &str = "peers";
pub const KEY_LOG_LEVEL: &str = "logLevel";
pub const KEY_HEARTBEAT_PORT: &str = "heartbeatPort";
pub const KEY_REPLICA_PORT: &str = "replicaPort";
pub const KEY_RETAIN_LOGS: &str = "retainLogs";
pub const KEY_TICK_INTERVAL: &str = "tickInterval";
pub const KEY_ELECTION_TICK: &str = "electionTick";
pub const KEY_RAFT_RECV_BUF_SIZE: &str = "raftRecvBufSize";
pub const KEY_STARTUP_TIMEOUT: &str = "startupTimeout";
pub const KEY_FAULT_DOMAIN: &str = "faultDomain";
pub const KEY_DOMAIN_BUILD_AS_POSSIBLE: &str = "faultDomainBuildAsPossible";
pub const KEY_DOMAIN_GRP_BATCH_CNT: &str = "faultDomainGrpBatchCnt";
pub const KEY_NODE_SET_CAPACITY: &str = "nodeSetCap";
pub const KEY_META_NODE_RESERVED_MEM: &str = "metaNodeReservedMem";
pub const KEY_MISSING_DP_INTERVAL: &str = "missingDataPartitionInterval";
pub const KEY_DP_TIMEOUT_SEC: &str = "dataPartitionTimeOutSec";
pub const KEY_DPS_TO_LOAD: &str = "numberOfDataPartitionsToLoad";
pub const KEY_SECONDS_TO_FREE_DP: &str = "secondsToFreeDataPartitionAfterLoad";

pub const DEFAULT_HEARTBEAT_PORT: u16 = 5901;
pub const DEFAULT_REPLICA_PORT: u16 = 5902;
pub const MIN_UNPRIVILEGED_PORT: i64 = 1024;
pub const DEFAULT_RETAIN_LOGS: u64 = 20000;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 500;
pub const MIN_TICK_INTERVAL_MS: i64 = 300;
pub const DEFAULT_ELECTION_TICK: usize = 5;
pub const MIN_ELECTION_TICK: i64 = 3;
pub const DEFAULT_RAFT_RECV_BUF_SIZE: usize = 2048;
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_NODE_SET_CAPACITY: usize = 18;
pub const MIN_NODE_SET_CAPACITY: i64 = 3;
pub const DEFAULT_META_NODE_RESERVED_MEM: u64 = 1024 * 1024 * 1024;
pub const MIN_META_NODE_RESERVED_MEM: i64 = 32 * 1024 * 1024;
pub const DEFAULT_DOMAIN_GRP_BATCH_CNT: usize = 3;
pub const DEFAULT_MISSING_DP_INTERVAL_SECS: i64 = 24 * 3600;
pub const DEFAULT_DP_TIMEOUT_SECS: i64 = 600;
pub const MIN_DPS_TO_LOAD: usize = 40;
pub const DEFAULT_SECONDS_TO_FREE_DP: i64 = 300;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Flat key/value configuration as supplied by the operator.
///
/// Unrecognized keys are kept but never consulted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawConfig {
    values: BTreeMap<String, String>,
}

impl RawConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::InvalidConfig(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Top-level scalars become string values; tables and arrays are ignored.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse config: {e}")))?;
        let mut raw = Self::new();
        for (key, value) in table {
            let rendered = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Datetime(d) => d.to_string(),
                toml::Value::Array(_) | toml::Value::Table(_) => {
                    tracing::debug!("ignoring non-scalar config key {}", key);
                    continue;
                }
            };
            raw.values.insert(key, rendered);
        }
        Ok(raw)
    }

    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.set(key, value);
        self
    }

    /// Trimmed value, `None` when absent or blank.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// A replication peer: `id@host:port`, where `host:port` is the peer's
/// management address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub id: u64,
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id, addr) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| Error::InvalidConfig(format!("peer '{s}' is not id@host:port")))?;
        let id: u64 = id
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("peer '{s}' has bad id: {e}")))?;
        let (host, port) = split_host_port(addr)
            .ok_or_else(|| Error::InvalidConfig(format!("peer '{s}' has bad address")))?;
        Ok(Self { id, host, port })
    }
}

pub(crate) fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}

/// Parse the ordered, comma-separated peer list.
pub fn parse_peers(peers: &str) -> Result<Vec<PeerAddr>> {
    let mut parsed: Vec<PeerAddr> = Vec::new();
    for item in peers.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let peer: PeerAddr = item.parse()?;
        if peer.id == 0 {
            return Err(Error::InvalidConfig(format!("peer '{item}' uses reserved id 0")));
        }
        if parsed.iter().any(|p| p.id == peer.id) {
            return Err(Error::InvalidConfig(format!("duplicate peer id {}", peer.id)));
        }
        parsed.push(peer);
    }
    if parsed.is_empty() {
        return Err(Error::InvalidConfig("peer list is empty".into()));
    }
    Ok(parsed)
}

/// Cluster-wide placement and partition-loading policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPolicy {
    pub fault_domain: bool,
    pub domain_build_as_possible: bool,
    pub domain_node_grp_batch_cnt: usize,
    pub node_set_capacity: usize,
    pub meta_node_reserved_mem: u64,
    pub missing_data_partition_interval: Duration,
    pub data_partition_timeout: Duration,
    pub number_of_data_partitions_to_load: usize,
    pub seconds_to_free_data_partition_after_load: Duration,
}

/// Validated master configuration; immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub node_id: u64,
    pub cluster_name: String,
    pub ip: String,
    pub port: u16,
    pub wal_dir: PathBuf,
    pub store_dir: PathBuf,
    pub peers: Vec<PeerAddr>,
    pub heartbeat_port: u16,
    pub replica_port: u16,
    pub retain_logs: u64,
    pub tick_interval: Duration,
    pub election_tick: usize,
    pub raft_recv_buf_size: usize,
    pub startup_timeout: Duration,
    pub log_level: String,
    pub policy: ClusterPolicy,
}

/// Output of the required pass.
struct RequiredFields {
    node_id: u64,
    cluster_name: String,
    ip: String,
    port: u16,
    wal_dir: PathBuf,
    store_dir: PathBuf,
    peers: Vec<PeerAddr>,
}

impl ClusterConfig {
    pub fn validate(raw: &RawConfig) -> Result<Self> {
        let required = Self::required_pass(raw)?;
        let cfg = Self::floor_pass(raw, required)?;
        tracing::info!(
            "validated config: node_id={} cluster={} peers={:?} heartbeat_port={} replica_port={} retain_logs={} tick={:?} election_tick={}",
            cfg.node_id,
            cfg.cluster_name,
            cfg.peers.iter().map(|p| p.id).collect::<Vec<_>>(),
            cfg.heartbeat_port,
            cfg.replica_port,
            cfg.retain_logs,
            cfg.tick_interval,
            cfg.election_tick
        );
        Ok(cfg)
    }

    fn required_pass(raw: &RawConfig) -> Result<RequiredFields> {
        let keys = [
            KEY_IP,
            KEY_PORT,
            KEY_WAL_DIR,
            KEY_STORE_DIR,
            KEY_CLUSTER_NAME,
            KEY_PEERS,
        ];
        let missing: Vec<&str> = keys
            .iter()
            .copied()
            .filter(|k| raw.get(k).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "required keys are empty: {}",
                missing.join(",")
            )));
        }
        let node_id: u64 = raw
            .get(KEY_ID)
            .ok_or_else(|| Error::InvalidConfig(format!("{KEY_ID} is empty")))?
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("{KEY_ID}: {e}")))?;

        let cluster_name = required(raw, KEY_CLUSTER_NAME)?.to_string();
        if !cluster_name_regex().is_match(&cluster_name) {
            return Err(Error::InvalidConfig(format!(
                "{KEY_CLUSTER_NAME} '{cluster_name}' does not match {}",
                cluster_name_regex().as_str()
            )));
        }
        let ip = required(raw, KEY_IP)?;
        // listeners bind this literally; hostnames are not resolved
        if ip.parse::<IpAddr>().is_err() {
            return Err(Error::InvalidConfig(format!(
                "{KEY_IP} '{ip}' is not an IP address"
            )));
        }
        let port: u16 = parse_explicit(raw, KEY_PORT)?
            .ok_or_else(|| Error::InvalidConfig(format!("{KEY_PORT} is empty")))?;

        let peers = parse_peers(required(raw, KEY_PEERS)?)?;
        if !peers.iter().any(|p| p.id == node_id) {
            return Err(Error::InvalidConfig(format!(
                "node id {node_id} is not in the peer list"
            )));
        }

        Ok(RequiredFields {
            node_id,
            cluster_name,
            ip: ip.to_string(),
            port,
            wal_dir: PathBuf::from(required(raw, KEY_WAL_DIR)?),
            store_dir: PathBuf::from(required(raw, KEY_STORE_DIR)?),
            peers,
        })
    }

    fn floor_pass(raw: &RawConfig, req: RequiredFields) -> Result<Self> {
        let heartbeat_port = port_with_floor(raw, KEY_HEARTBEAT_PORT, DEFAULT_HEARTBEAT_PORT)?;
        let replica_port = port_with_floor(raw, KEY_REPLICA_PORT, DEFAULT_REPLICA_PORT)?;

        let retain_logs = floor(raw, KEY_RETAIN_LOGS, |v| v <= 0, DEFAULT_RETAIN_LOGS)?;
        let tick_ms = floor(
            raw,
            KEY_TICK_INTERVAL,
            |v| v <= MIN_TICK_INTERVAL_MS,
            DEFAULT_TICK_INTERVAL_MS,
        )?;
        let election_tick = floor(
            raw,
            KEY_ELECTION_TICK,
            |v| v <= MIN_ELECTION_TICK,
            DEFAULT_ELECTION_TICK,
        )?;
        let raft_recv_buf_size = floor(
            raw,
            KEY_RAFT_RECV_BUF_SIZE,
            |v| v <= 0,
            DEFAULT_RAFT_RECV_BUF_SIZE,
        )?;
        let startup_timeout = floor(
            raw,
            KEY_STARTUP_TIMEOUT,
            |v| v <= 0,
            DEFAULT_STARTUP_TIMEOUT_SECS,
        )?;

        let policy = ClusterPolicy {
            fault_domain: parse_explicit(raw, KEY_FAULT_DOMAIN)?.unwrap_or(false),
            domain_build_as_possible: parse_explicit(raw, KEY_DOMAIN_BUILD_AS_POSSIBLE)?
                .unwrap_or(false),
            domain_node_grp_batch_cnt: floor(
                raw,
                KEY_DOMAIN_GRP_BATCH_CNT,
                |v| v <= 0,
                DEFAULT_DOMAIN_GRP_BATCH_CNT,
            )?,
            node_set_capacity: floor(
                raw,
                KEY_NODE_SET_CAPACITY,
                |v| v < MIN_NODE_SET_CAPACITY,
                DEFAULT_NODE_SET_CAPACITY,
            )?,
            meta_node_reserved_mem: floor(
                raw,
                KEY_META_NODE_RESERVED_MEM,
                |v| v < MIN_META_NODE_RESERVED_MEM,
                DEFAULT_META_NODE_RESERVED_MEM,
            )?,
            missing_data_partition_interval: Duration::from_secs(floor(
                raw,
                KEY_MISSING_DP_INTERVAL,
                |v| v <= 0,
                DEFAULT_MISSING_DP_INTERVAL_SECS as u64,
            )?),
            data_partition_timeout: Duration::from_secs(floor(
                raw,
                KEY_DP_TIMEOUT_SEC,
                |v| v <= 0,
                DEFAULT_DP_TIMEOUT_SECS as u64,
            )?),
            number_of_data_partitions_to_load: floor(
                raw,
                KEY_DPS_TO_LOAD,
                |v| v <= MIN_DPS_TO_LOAD as i64,
                MIN_DPS_TO_LOAD,
            )?,
            seconds_to_free_data_partition_after_load: Duration::from_secs(floor(
                raw,
                KEY_SECONDS_TO_FREE_DP,
                |v| v <= 0,
                DEFAULT_SECONDS_TO_FREE_DP as u64,
            )?),
        };

        Ok(Self {
            node_id: req.node_id,
            cluster_name: req.cluster_name,
            ip: req.ip,
            port: req.port,
            wal_dir: req.wal_dir,
            store_dir: req.store_dir,
            peers: req.peers,
            heartbeat_port,
            replica_port,
            retain_logs,
            tick_interval: Duration::from_millis(tick_ms),
            election_tick,
            raft_recv_buf_size,
            startup_timeout: Duration::from_secs(startup_timeout),
            log_level: raw.get(KEY_LOG_LEVEL).unwrap_or(DEFAULT_LOG_LEVEL).to_string(),
            policy,
        })
    }

    /// Render back to the flat form; `validate(&cfg.to_raw()) == cfg`.
    pub fn to_raw(&self) -> RawConfig {
        let peers = self
            .peers
            .iter()
            .map(|p| format!("{}@{}", p.id, p.addr()))
            .collect::<Vec<_>>()
            .join(",");
        let p = &self.policy;
        RawConfig::new()
            .with(KEY_ID, self.node_id.to_string())
            .with(KEY_CLUSTER_NAME, self.cluster_name.clone())
            .with(KEY_IP, self.ip.clone())
            .with(KEY_PORT, self.port.to_string())
            .with(KEY_WAL_DIR, self.wal_dir.to_string_lossy())
            .with(KEY_STORE_DIR, self.store_dir.to_string_lossy())
            .with(KEY_PEERS, peers)
            .with(KEY_LOG_LEVEL, self.log_level.clone())
            .with(KEY_HEARTBEAT_PORT, self.heartbeat_port.to_string())
            .with(KEY_REPLICA_PORT, self.replica_port.to_string())
            .with(KEY_RETAIN_LOGS, self.retain_logs.to_string())
            .with(KEY_TICK_INTERVAL, self.tick_interval.as_millis().to_string())
            .with(KEY_ELECTION_TICK, self.election_tick.to_string())
            .with(KEY_RAFT_RECV_BUF_SIZE, self.raft_recv_buf_size.to_string())
            .with(KEY_STARTUP_TIMEOUT, self.startup_timeout.as_secs().to_string())
            .with(KEY_FAULT_DOMAIN, p.fault_domain.to_string())
            .with(KEY_DOMAIN_BUILD_AS_POSSIBLE, p.domain_build_as_possible.to_string())
            .with(KEY_DOMAIN_GRP_BATCH_CNT, p.domain_node_grp_batch_cnt.to_string())
            .with(KEY_NODE_SET_CAPACITY, p.node_set_capacity.to_string())
            .with(KEY_META_NODE_RESERVED_MEM, p.meta_node_reserved_mem.to_string())
            .with(
                KEY_MISSING_DP_INTERVAL,
                p.missing_data_partition_interval.as_secs().to_string(),
            )
            .with(KEY_DP_TIMEOUT_SEC, p.data_partition_timeout.as_secs().to_string())
            .with(KEY_DPS_TO_LOAD, p.number_of_data_partitions_to_load.to_string())
            .with(
                KEY_SECONDS_TO_FREE_DP,
                p.seconds_to_free_data_partition_after_load.as_secs().to_string(),
            )
    }

    /// Management address of this master.
    pub fn api_addr(&self) -> String {
        match self.ip.parse::<IpAddr>() {
            Ok(ip) => std::net::SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.ip, self.port),
        }
    }

    pub fn peer(&self, id: u64) -> Option<&PeerAddr> {
        self.peers.iter().find(|p| p.id == id)
    }
}

fn cluster_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new("^[a-zA-Z0-9]([a-zA-Z0-9_.-]{0,61}[a-zA-Z0-9])?$")
            .unwrap_or_else(|e| panic!("cluster name pattern: {e}"))
    })
}

fn required<'a>(raw: &'a RawConfig, key: &str) -> Result<&'a str> {
    raw.get(key)
        .ok_or_else(|| Error::InvalidConfig(format!("{key} is empty")))
}

/// `Ok(None)` when unset, `InvalidConfig` when supplied but unparsable.
fn parse_explicit<T>(raw: &RawConfig, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match raw.get(key) {
        None => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::InvalidConfig(format!("{key}='{v}': {e}"))),
    }
}

/// Floor rule: unset or `below(value)` yields `default`.
fn floor<T>(raw: &RawConfig, key: &str, below: impl Fn(i64) -> bool, default: T) -> Result<T>
where
    T: TryFrom<i64> + Copy,
{
    let value = match parse_explicit::<i64>(raw, key)? {
        None => return Ok(default),
        Some(v) if below(v) => return Ok(default),
        Some(v) => v,
    };
    T::try_from(value).map_err(|_| Error::InvalidConfig(format!("{key}={value} is out of range")))
}

fn port_with_floor(raw: &RawConfig, key: &str, default: u16) -> Result<u16> {
    floor(raw, key, |v| v < MIN_UNPRIVILEGED_PORT, default)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEERS: &str = "1@10.0.0.1:17010,2@10.0.0.2:17010,3@10.0.0.3:17010";

    fn base() -> RawConfig {
        RawConfig::new()
            .with(KEY_ID, "1")
            .with(KEY_CLUSTER_NAME, "pillar-test")
            .with(KEY_IP, "10.0.0.1")
            .with(KEY_PORT, "17010")
            .with(KEY_WAL_DIR, "/var/lib/pillar/wal")
            .with(KEY_STORE_DIR, "/var/lib/pillar/store")
            .with(KEY_PEERS, PEERS)
    }

    #[test]
    fn test_three_peers_and_default_heartbeat_port() {
        let cfg = ClusterConfig::validate(&base().with(KEY_HEARTBEAT_PORT, "")).unwrap();
        assert_eq!(cfg.heartbeat_port, DEFAULT_HEARTBEAT_PORT);
        assert_eq!(cfg.replica_port, DEFAULT_REPLICA_PORT);
        assert_eq!(
            cfg.peers.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(cfg.peers[1].addr(), "10.0.0.2:17010");
        assert_eq!(cfg.api_addr(), "10.0.0.1:17010");
    }

    #[test]
    fn test_required_keys() {
        for key in [
            KEY_ID,
            KEY_IP,
            KEY_PORT,
            KEY_WAL_DIR,
            KEY_STORE_DIR,
            KEY_CLUSTER_NAME,
            KEY_PEERS,
        ] {
            let raw = base().with(key, "  ");
            match ClusterConfig::validate(&raw) {
                Err(Error::InvalidConfig(_)) => {}
                other => panic!("{key}: expected InvalidConfig, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_bad_identity_and_peers() {
        let cases = [
            (KEY_ID, "one"),
            (KEY_ID, "-1"),
            (KEY_ID, "4"),
            (KEY_IP, "master-1.local"),
            (KEY_IP, "10.0.0.300"),
            (KEY_PORT, "http"),
            (KEY_CLUSTER_NAME, "-bad-"),
            (KEY_PEERS, "1:10.0.0.1:17010"),
            (KEY_PEERS, "1@10.0.0.1"),
            (KEY_PEERS, "x@10.0.0.1:17010"),
            (KEY_PEERS, "1@10.0.0.1:17010,1@10.0.0.2:17010"),
            (KEY_PEERS, "0@10.0.0.1:17010,1@10.0.0.2:17010"),
        ];
        for (key, value) in cases {
            assert!(
                matches!(
                    ClusterConfig::validate(&base().with(key, value)),
                    Err(Error::InvalidConfig(_))
                ),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_floor_defaults() {
        let raw = base()
            .with(KEY_HEARTBEAT_PORT, "80")
            .with(KEY_REPLICA_PORT, "0")
            .with(KEY_NODE_SET_CAPACITY, "2")
            .with(KEY_META_NODE_RESERVED_MEM, "1024")
            .with(KEY_RETAIN_LOGS, "0")
            .with(KEY_TICK_INTERVAL, "300")
            .with(KEY_ELECTION_TICK, "3")
            .with(KEY_DPS_TO_LOAD, "10");
        let cfg = ClusterConfig::validate(&raw).unwrap();
        assert_eq!(cfg.heartbeat_port, DEFAULT_HEARTBEAT_PORT);
        assert_eq!(cfg.replica_port, DEFAULT_REPLICA_PORT);
        assert_eq!(cfg.policy.node_set_capacity, DEFAULT_NODE_SET_CAPACITY);
        assert_eq!(cfg.policy.meta_node_reserved_mem, DEFAULT_META_NODE_RESERVED_MEM);
        assert_eq!(cfg.retain_logs, DEFAULT_RETAIN_LOGS);
        assert_eq!(cfg.tick_interval, Duration::from_millis(DEFAULT_TICK_INTERVAL_MS));
        assert_eq!(cfg.election_tick, DEFAULT_ELECTION_TICK);
        assert_eq!(cfg.policy.number_of_data_partitions_to_load, MIN_DPS_TO_LOAD);
    }

    #[test]
    fn test_unset_tunables_take_defaults() {
        let cfg = ClusterConfig::validate(&base()).unwrap();
        assert_eq!(cfg.retain_logs, DEFAULT_RETAIN_LOGS);
        assert_eq!(cfg.raft_recv_buf_size, DEFAULT_RAFT_RECV_BUF_SIZE);
        assert_eq!(cfg.startup_timeout, Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS));
        assert_eq!(cfg.log_level, DEFAULT_LOG_LEVEL);
        assert!(!cfg.policy.fault_domain);
    }

    #[test]
    fn test_values_above_floor_are_kept() {
        let raw = base()
            .with(KEY_HEARTBEAT_PORT, "1024")
            .with(KEY_NODE_SET_CAPACITY, "3")
            .with(KEY_TICK_INTERVAL, "301")
            .with(KEY_ELECTION_TICK, "4")
            .with(KEY_RETAIN_LOGS, "1");
        let cfg = ClusterConfig::validate(&raw).unwrap();
        assert_eq!(cfg.heartbeat_port, 1024);
        assert_eq!(cfg.policy.node_set_capacity, 3);
        assert_eq!(cfg.tick_interval, Duration::from_millis(301));
        assert_eq!(cfg.election_tick, 4);
        assert_eq!(cfg.retain_logs, 1);
    }

    #[test]
    fn test_unparsable_numbers_are_fatal() {
        for key in [
            KEY_HEARTBEAT_PORT,
            KEY_REPLICA_PORT,
            KEY_NODE_SET_CAPACITY,
            KEY_META_NODE_RESERVED_MEM,
            KEY_RETAIN_LOGS,
            KEY_TICK_INTERVAL,
            KEY_ELECTION_TICK,
            KEY_RAFT_RECV_BUF_SIZE,
            KEY_MISSING_DP_INTERVAL,
            KEY_DP_TIMEOUT_SEC,
            KEY_DPS_TO_LOAD,
            KEY_SECONDS_TO_FREE_DP,
            KEY_DOMAIN_GRP_BATCH_CNT,
            KEY_STARTUP_TIMEOUT,
            KEY_FAULT_DOMAIN,
        ] {
            assert!(
                matches!(
                    ClusterConfig::validate(&base().with(key, "12abc")),
                    Err(Error::InvalidConfig(_))
                ),
                "{key} should reject garbage"
            );
        }
        assert!(matches!(
            ClusterConfig::validate(&base().with(KEY_REPLICA_PORT, "70000")),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_revalidation_is_noop() {
        let raw = base()
            .with(KEY_HEARTBEAT_PORT, "17330")
            .with(KEY_FAULT_DOMAIN, "true")
            .with(KEY_TICK_INTERVAL, "250")
            .with(KEY_META_NODE_RESERVED_MEM, "2147483648");
        let first = ClusterConfig::validate(&raw).unwrap();
        let second = ClusterConfig::validate(&first.to_raw()).unwrap();
        assert_eq!(first, second);

        let third = ClusterConfig::validate(&second.to_raw()).unwrap();
        assert_eq!(second, third);
    }

    #[test]
    fn test_toml_scalars_and_unknown_keys() {
        let raw = RawConfig::from_toml_str(
            r#"
            id = 2
            clusterName = "pillar"
            ip = "127.0.0.1"
            port = 17010
            walDir = "/tmp/wal"
            storeDir = "/tmp/store"
            peers = "1@127.0.0.1:17010,2@127.0.0.2:17010"
            faultDomain = true
            somethingElse = "ignored"

            [nested]
            key = 1
            "#,
        )
        .unwrap();
        assert_eq!(raw.get("port"), Some("17010"));
        assert_eq!(raw.get("nested"), None);
        let cfg = ClusterConfig::validate(&raw).unwrap();
        assert_eq!(cfg.node_id, 2);
        assert!(cfg.policy.fault_domain);
        assert_eq!(cfg.peer(1).map(|p| p.host.as_str()), Some("127.0.0.1"));
    }
}
