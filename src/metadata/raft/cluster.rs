use std::time::Duration;

use tokio::sync::watch;

/// Role and leadership of the local replica as last reported by raft.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaftStatus {
    pub leader_id: u64,
    pub term: u64,
    pub is_leader: bool,
}

/// Published by the raft loop, read by partition handles.
pub struct RaftClusterState {
    node_id: u64,
    tx: watch::Sender<RaftStatus>,
}

impl RaftClusterState {
    pub fn new(node_id: u64) -> Self {
        let (tx, _) = watch::channel(RaftStatus::default());
        Self { node_id, tx }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn set(&self, leader_id: u64, term: u64) {
        let status = RaftStatus {
            leader_id,
            term,
            is_leader: leader_id != 0 && leader_id == self.node_id,
        };
        self.tx.send_if_modified(|cur| {
            if *cur == status {
                return false;
            }
            *cur = status;
            true
        });
    }

    pub fn get(&self) -> RaftStatus {
        *self.tx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.get().is_leader
    }

    /// Wait until some replica is known to lead; `false` on timeout.
    pub async fn wait_for_leader(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let led = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| s.leader_id != 0)).await,
            Ok(Ok(_))
        );
        led
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_leader_times_out_then_succeeds() {
        let state = std::sync::Arc::new(RaftClusterState::new(2));
        assert!(!state.wait_for_leader(Duration::from_millis(20)).await);

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_for_leader(Duration::from_secs(5)).await })
        };
        state.set(3, 7);
        assert!(waiter.await.unwrap());
        assert_eq!(
            state.get(),
            RaftStatus {
                leader_id: 3,
                term: 7,
                is_leader: false
            }
        );
        state.set(2, 8);
        assert!(state.is_leader());
    }
}
