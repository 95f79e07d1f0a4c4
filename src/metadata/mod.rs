//! Replicated metadata layer
//!
//! - `fsm`: the deterministic state machine over the persistent store
//! - `raft`: consensus partition binding (raft-rs, RocksDB log, gRPC transport)
//! - `rocks`: the RocksDB-backed metadata store
//!
//! Every replica applies the same committed entries in the same order, so the
//! stores stay identical across masters.

pub mod fsm;
pub mod handler;
pub mod raft {
    pub mod cluster;
    pub mod raft_node;
    pub mod raft_store;
    pub mod raft_transport;
    pub mod rocks_store;
}
pub mod rocks;
pub mod snapshot;
pub mod utils;

pub use fsm::{Applied, FsmState, MetadataFsm};
pub use rocks::RocksDbStore;

