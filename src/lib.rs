pub mod common;
pub mod metadata;
pub mod server;

// Generated gRPC code
pub mod master {
    tonic::include_proto!("pillar.master");
}
