use std::sync::{Arc, OnceLock};

use prost::Message;
use regex::Regex;

use crate::common::{Error, Result, unix_millis};
use crate::master::{AddUser, DeleteUser, MetaCmd, UserInfo, meta_cmd::Op};
use crate::metadata::MetadataFsm;
use crate::metadata::handler::{CommandOutput, Mutation, StoreReader};
use crate::metadata::raft::raft_store::Partition;
use crate::metadata::utils::{USER_PREFIX, kv_user_key};

fn user_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new("^[a-zA-Z0-9_.-]{1,64}$").unwrap_or_else(|e| panic!("user id pattern: {e}"))
    })
}

/// User accounts. Writes go through the partition, reads hit the local store.
pub struct UserManager {
    sm: Arc<MetadataFsm>,
    partition: Partition,
}

impl UserManager {
    pub fn new(sm: Arc<MetadataFsm>, partition: Partition) -> Self {
        Self { sm, partition }
    }

    pub async fn create_user(&self, user_id: &str, description: &str) -> Result<UserInfo> {
        if !user_id_regex().is_match(user_id) {
            return Err(Error::InvalidArgument(format!("invalid user id '{user_id}'")));
        }
        if self.get_user(user_id).is_ok() {
            return Err(Error::AlreadyExists(user_id.to_string()));
        }
        let secret = uuid::Uuid::new_v4().simple().to_string();
        let user = UserInfo {
            user_id: user_id.to_string(),
            access_key: secret[..16].to_string(),
            secret_key: uuid::Uuid::new_v4().simple().to_string(),
            description: description.to_string(),
            create_time: unix_millis(),
        };
        let cmd = MetaCmd {
            op: Some(Op::AddUser(AddUser {
                user: Some(user.clone()),
            })),
        };
        self.partition.submit(&cmd).await?;
        tracing::info!("created user {}", user_id);
        Ok(user)
    }

    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.get_user(user_id)?;
        let cmd = MetaCmd {
            op: Some(Op::DeleteUser(DeleteUser {
                user_id: user_id.to_string(),
            })),
        };
        self.partition.submit(&cmd).await?;
        tracing::info!("deleted user {}", user_id);
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<UserInfo> {
        let raw = self
            .sm
            .get(&kv_user_key(user_id))?
            .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;
        Ok(UserInfo::decode(raw.as_slice())?)
    }

    pub fn list_users(&self) -> Result<Vec<UserInfo>> {
        self.sm
            .scan_prefix(USER_PREFIX)?
            .into_iter()
            .map(|(_, v)| Ok(UserInfo::decode(v.as_slice())?))
            .collect()
    }
}

pub(crate) fn apply_add_user(cmd: &AddUser, store: &dyn StoreReader) -> Result<CommandOutput> {
    let user = cmd
        .user
        .as_ref()
        .ok_or_else(|| Error::Serialization("add user without payload".into()))?;
    let key = kv_user_key(&user.user_id);
    if store.get(&key)?.is_some() {
        return Err(Error::AlreadyExists(format!("user {}", user.user_id)));
    }
    Ok(CommandOutput {
        mutations: vec![Mutation::put(key, user.encode_to_vec())],
        response: Vec::new(),
    })
}

pub(crate) fn apply_delete_user(cmd: &DeleteUser, store: &dyn StoreReader) -> Result<CommandOutput> {
    let key = kv_user_key(&cmd.user_id);
    if store.get(&key)?.is_none() {
        return Err(Error::NotFound(format!("user {}", cmd.user_id)));
    }
    Ok(CommandOutput {
        mutations: vec![Mutation::delete(key)],
        response: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::cluster::tests::MapStore;

    #[test]
    fn test_add_then_duplicate_then_delete() {
        let mut store = MapStore::default();
        let add = AddUser {
            user: Some(UserInfo {
                user_id: "alice".into(),
                ..Default::default()
            }),
        };
        store.commit(apply_add_user(&add, &store).unwrap());
        assert!(matches!(
            apply_add_user(&add, &store),
            Err(Error::AlreadyExists(_))
        ));

        let del = DeleteUser {
            user_id: "alice".into(),
        };
        let out = apply_delete_user(&del, &store).unwrap();
        assert_eq!(out.mutations, vec![Mutation::delete(kv_user_key("alice"))]);
        assert!(matches!(
            apply_delete_user(
                &DeleteUser {
                    user_id: "bob".into()
                },
                &store
            ),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_user_id_pattern() {
        assert!(user_id_regex().is_match("alice"));
        assert!(user_id_regex().is_match("svc.backup-01"));
        assert!(!user_id_regex().is_match(""));
        assert!(!user_id_regex().is_match("#user#x"));
        assert!(!user_id_regex().is_match(&"a".repeat(65)));
    }
}
