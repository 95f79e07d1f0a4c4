use crate::common::{Error, Result};
use crate::master::{MetaCmd, meta_cmd::Op};
use crate::metadata::handler::{CommandHandler, CommandOutput, StoreReader};
use crate::server::cluster::{apply_register_node, apply_remove_node, apply_update_node_status};
use crate::server::user::{apply_add_user, apply_delete_user};

/// Dispatches committed commands to the user and cluster subsystems.
/// Holds no state of its own: apply sees only the command and the store.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandRouter;

impl CommandHandler for CommandRouter {
    fn handle(&self, cmd: &MetaCmd, store: &dyn StoreReader) -> Result<CommandOutput> {
        match cmd.op.as_ref() {
            Some(Op::AddUser(c)) => apply_add_user(c, store),
            Some(Op::DeleteUser(c)) => apply_delete_user(c, store),
            Some(Op::RegisterNode(c)) => apply_register_node(c, store),
            Some(Op::UpdateNodeStatus(c)) => apply_update_node_status(c, store),
            Some(Op::RemoveNode(c)) => apply_remove_node(c, store),
            None => Err(Error::Serialization("command without operation".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::{AddUser, NodeInfo, NodeKind, RegisterNode, UserInfo};
    use crate::metadata::MetadataFsm;
    use crate::metadata::rocks::RocksDbStore;
    use crate::metadata::utils::{NODE_PREFIX, USER_PREFIX, kv_user_key};
    use crate::server::cluster::tests::register;
    use prost::Message;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn fsm(dir: &std::path::Path) -> MetadataFsm {
        let store = RocksDbStore::open(dir, 8 << 20, 4 << 20).unwrap();
        let fsm = MetadataFsm::new(store, 20000);
        fsm.register_user_command_handler(Arc::new(CommandRouter))
            .unwrap();
        fsm.restore().unwrap();
        fsm
    }

    fn create_user(name: &str) -> Vec<u8> {
        MetaCmd {
            op: Some(Op::AddUser(AddUser {
                user: Some(UserInfo {
                    user_id: name.into(),
                    create_time: 1_700_000_000_000,
                    ..Default::default()
                }),
            })),
        }
        .encode_to_vec()
    }

    #[test]
    fn test_duplicate_user_fails_but_index_advances() {
        let dir = tempdir().unwrap();
        let fsm = fsm(dir.path());

        let first = fsm.apply(1, &create_user("alice")).unwrap();
        assert!(first.result.is_ok());
        let second = fsm.apply(2, &create_user("alice")).unwrap();
        assert!(matches!(second.result, Err(Error::Apply(_))));

        assert_eq!(fsm.applied_index(), 2);
        let users = fsm.scan_prefix(USER_PREFIX).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].0, kv_user_key("alice"));
    }

    #[test]
    fn test_register_node_replies_with_record() {
        let dir = tempdir().unwrap();
        let fsm = fsm(dir.path());
        let cmd = MetaCmd {
            op: Some(Op::RegisterNode(RegisterNode {
                addr: "10.0.1.1:17310".into(),
                zone: "z1".into(),
                kind: NodeKind::Meta as i32,
                total_bytes: 1 << 30,
                register_time: 1_700_000_000_000,
                node_set_capacity: 18,
            })),
        };
        let applied = fsm.apply(1, &cmd.encode_to_vec()).unwrap();
        let node = NodeInfo::decode(applied.result.unwrap().as_slice()).unwrap();
        assert_eq!(node.id, 1);
        assert_eq!(node.kind(), NodeKind::Meta);
    }

    #[test]
    fn test_command_without_operation() {
        let dir = tempdir().unwrap();
        let fsm = fsm(dir.path());
        let empty = MetaCmd { op: None }.encode_to_vec();
        // an empty oneof encodes to zero bytes, which the state machine treats as a no-op
        assert!(empty.is_empty());
        assert!(fsm.apply(1, &empty).unwrap().result.is_ok());
        assert!(matches!(
            CommandRouter.handle(&MetaCmd { op: None }, &fsm),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_replicas_place_nodes_alike() {
        let (dir_a, dir_b) = (tempdir().unwrap(), tempdir().unwrap());
        let (a, b) = (fsm(dir_a.path()), fsm(dir_b.path()));
        let entries: Vec<Vec<u8>> = (1..=4)
            .map(|i| {
                MetaCmd {
                    op: Some(Op::RegisterNode(register(
                        &format!("10.0.1.{i}:17310"),
                        "z1",
                        3,
                    ))),
                }
                .encode_to_vec()
            })
            .collect();
        for (i, data) in entries.iter().enumerate() {
            a.apply(i as u64 + 1, data).unwrap().result.unwrap();
            b.apply(i as u64 + 1, data).unwrap().result.unwrap();
        }

        let nodes = a.scan_prefix(NODE_PREFIX).unwrap();
        assert_eq!(nodes, b.scan_prefix(NODE_PREFIX).unwrap());
        assert_eq!(a.applied_index(), b.applied_index());
        let sets: Vec<u64> = nodes
            .iter()
            .map(|(_, v)| NodeInfo::decode(v.as_slice()).unwrap().node_set_id)
            .collect();
        assert_eq!(sets, vec![1, 1, 1, 2]);
    }
}
