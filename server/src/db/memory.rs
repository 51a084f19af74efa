use super::{DirectoryStore, StoredCredential};
use async_trait::async_trait;
use ldap_gateway_core::{GroupRecord, ProviderError, UserRecord};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process store, used for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<Vec<UserRecord>>,
    groups: RwLock<Vec<GroupRecord>>,
    credentials: RwLock<HashMap<String, StoredCredential>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: UserRecord, credential: Option<StoredCredential>) {
        if let Some(credential) = credential {
            self.credentials
                .write()
                .await
                .insert(user.username.clone(), credential);
        }
        let mut users = self.users.write().await;
        users.retain(|u| u.username != user.username);
        users.push(user);
    }

    pub async fn insert_group(&self, group: GroupRecord) {
        let mut groups = self.groups.write().await;
        groups.retain(|g| g.name != group.name);
        groups.push(group);
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn find_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserRecord>, ProviderError> {
        Ok(self
            .users
            .read()
            .await
            .iter()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn get_all_users(&self) -> Result<Vec<UserRecord>, ProviderError> {
        Ok(self.users.read().await.clone())
    }

    async fn find_groups_by_member_uid(
        &self,
        username: &str,
    ) -> Result<Vec<GroupRecord>, ProviderError> {
        Ok(self
            .groups
            .read()
            .await
            .iter()
            .filter(|g| g.has_member(username))
            .cloned()
            .collect())
    }

    async fn get_all_groups(&self) -> Result<Vec<GroupRecord>, ProviderError> {
        Ok(self.groups.read().await.clone())
    }

    async fn find_credentials(
        &self,
        username: &str,
    ) -> Result<Option<StoredCredential>, ProviderError> {
        Ok(self.credentials.read().await.get(username).cloned())
    }
}
