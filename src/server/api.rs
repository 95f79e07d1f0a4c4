use std::sync::Arc;

use raft::prelude::ConfChangeType;
use tonic::{Request, Response, Status};

use crate::common::Error;
use crate::common::config::split_host_port;
use crate::master::{
    CreateUserRequest, DeleteUserRequest, GetLeaderRequest, GetLeaderResponse, GetUserRequest,
    ListNodesRequest, ListNodesResponse, NodeHeartbeatRequest, NodeInfo, NodeKind,
    RaftNodeRequest, RegisterNodeRequest, RemoveNodeRequest, UserInfo,
    master_api_server::{MasterApi, MasterApiServer},
};
use crate::metadata::raft::raft_store::Partition;
use crate::server::cluster::Cluster;
use crate::server::coordinator::Coordinator;
use crate::server::user::UserManager;

pub struct MasterApiService {
    coordinator: Arc<Coordinator>,
    cluster: Arc<Cluster>,
    users: Arc<UserManager>,
    partition: Partition,
}

impl MasterApiService {
    pub fn new(
        coordinator: Arc<Coordinator>,
        cluster: Arc<Cluster>,
        users: Arc<UserManager>,
        partition: Partition,
    ) -> Self {
        Self {
            coordinator,
            cluster,
            users,
            partition,
        }
    }

    pub fn into_server(self) -> MasterApiServer<Self> {
        MasterApiServer::new(self)
    }

    fn ensure_leader(&self) -> Result<(), Status> {
        self.coordinator.ensure_leader().map_err(Status::from)
    }

    /// Leadership can move between the readiness check and the proposal, so
    /// a `NotLeader` from the partition gets the current leader filled in.
    fn to_status(&self, err: Error) -> Status {
        match err {
            Error::NotLeader { leader: None } => {
                let info = self.coordinator.leader_info();
                Status::from(Error::NotLeader {
                    leader: (!info.addr.is_empty() && !info.is_self).then(|| info.addr.clone()),
                })
            }
            other => Status::from(other),
        }
    }

    async fn change_member(&self, kind: ConfChangeType, req: RaftNodeRequest) -> Result<(), Status> {
        self.ensure_leader()?;
        if req.id == 0 {
            return Err(Status::invalid_argument("raft node id must be non-zero"));
        }
        if kind == ConfChangeType::AddNode && split_host_port(&req.addr).is_none() {
            return Err(Status::invalid_argument(format!(
                "invalid raft node address '{}'",
                req.addr
            )));
        }
        tracing::info!("membership {:?} for node {} ({})", kind, req.id, req.addr);
        self.partition
            .change_member(kind, req.id, &req.addr)
            .await
            .map_err(|e| self.to_status(e))
    }
}

#[tonic::async_trait]
impl MasterApi for MasterApiService {
    async fn get_leader(
        &self,
        _request: Request<GetLeaderRequest>,
    ) -> Result<Response<GetLeaderResponse>, Status> {
        let info = self.coordinator.leader_info();
        Ok(Response::new(GetLeaderResponse {
            leader_id: info.leader_id,
            leader_addr: info.addr.clone(),
            term: info.term,
            is_self: info.is_self,
        }))
    }

    async fn create_user(
        &self,
        request: Request<CreateUserRequest>,
    ) -> Result<Response<UserInfo>, Status> {
        self.ensure_leader()?;
        let req = request.into_inner();
        let user = self
            .users
            .create_user(&req.user_id, &req.description)
            .await
            .map_err(|e| self.to_status(e))?;
        Ok(Response::new(user))
    }

    async fn delete_user(&self, request: Request<DeleteUserRequest>) -> Result<Response<()>, Status> {
        self.ensure_leader()?;
        let req = request.into_inner();
        self.users
            .delete_user(&req.user_id)
            .await
            .map_err(|e| self.to_status(e))?;
        Ok(Response::new(()))
    }

    async fn get_user(&self, request: Request<GetUserRequest>) -> Result<Response<UserInfo>, Status> {
        let user = self.users.get_user(&request.into_inner().user_id)?;
        Ok(Response::new(user))
    }

    async fn register_node(
        &self,
        request: Request<RegisterNodeRequest>,
    ) -> Result<Response<NodeInfo>, Status> {
        self.ensure_leader()?;
        let req = request.into_inner();
        let kind = NodeKind::try_from(req.kind)
            .map_err(|_| Status::invalid_argument(format!("unknown node kind {}", req.kind)))?;
        let node = self
            .cluster
            .register_node(&req.addr, &req.zone, kind, req.total_bytes)
            .await
            .map_err(|e| self.to_status(e))?;
        Ok(Response::new(node))
    }

    async fn node_heartbeat(
        &self,
        request: Request<NodeHeartbeatRequest>,
    ) -> Result<Response<()>, Status> {
        self.ensure_leader()?;
        self.cluster
            .heartbeat(request.into_inner().id)
            .await
            .map_err(|e| self.to_status(e))?;
        Ok(Response::new(()))
    }

    async fn list_nodes(
        &self,
        _request: Request<ListNodesRequest>,
    ) -> Result<Response<ListNodesResponse>, Status> {
        let nodes = self.cluster.list_nodes()?;
        Ok(Response::new(ListNodesResponse { nodes }))
    }

    async fn remove_node(&self, request: Request<RemoveNodeRequest>) -> Result<Response<()>, Status> {
        self.ensure_leader()?;
        self.cluster
            .remove_node(request.into_inner().id)
            .await
            .map_err(|e| self.to_status(e))?;
        Ok(Response::new(()))
    }

    async fn add_raft_node(&self, request: Request<RaftNodeRequest>) -> Result<Response<()>, Status> {
        self.change_member(ConfChangeType::AddNode, request.into_inner())
            .await?;
        Ok(Response::new(()))
    }

    async fn remove_raft_node(
        &self,
        request: Request<RaftNodeRequest>,
    ) -> Result<Response<()>, Status> {
        self.change_member(ConfChangeType::RemoveNode, request.into_inner())
            .await?;
        Ok(Response::new(()))
    }
}
