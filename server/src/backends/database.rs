//! Database-backed auth and directory providers

use crate::db::{DirectoryStore, StoredCredential};
use async_trait::async_trait;
use ldap_gateway_core::{
    AuthProvider, BindContext, Credential, DirectoryProvider, Filter, GroupRecord, ProviderError,
    UserRecord,
};
use sha2::Sha512;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

const PBKDF2_ROUNDS: u32 = 1000;
const PBKDF2_KEY_LEN: usize = 64;

/// Hex PBKDF2-HMAC-SHA512 digest as stored in salted rows.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut out = [0u8; PBKDF2_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), salt.as_bytes(), PBKDF2_ROUNDS, &mut out);
    hex::encode(out)
}

pub fn verify_password(password: &str, stored: &StoredCredential) -> bool {
    match &stored.salt {
        Some(salt) => {
            let computed = hash_password(password, salt);
            computed
                .as_bytes()
                .ct_eq(stored.password.to_ascii_lowercase().as_bytes())
                .into()
        }
        None => password.as_bytes().ct_eq(stored.password.as_bytes()).into(),
    }
}

pub struct DatabaseAuth {
    store: Arc<dyn DirectoryStore>,
}

impl DatabaseAuth {
    pub fn new(store: Arc<dyn DirectoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuthProvider for DatabaseAuth {
    async fn authenticate(
        &self,
        credential: &Credential,
        _context: &BindContext,
    ) -> Result<bool, ProviderError> {
        let Some(stored) = self.store.find_credentials(credential.username()).await? else {
            debug!("No stored credentials for {}", credential.username());
            return Ok(false);
        };
        Ok(verify_password(credential.password(), &stored))
    }
}

pub struct DatabaseDirectory {
    store: Arc<dyn DirectoryStore>,
}

impl DatabaseDirectory {
    pub fn new(store: Arc<dyn DirectoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DirectoryProvider for DatabaseDirectory {
    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, ProviderError> {
        self.store.find_user_by_username(username).await
    }

    async fn get_all_users(&self) -> Result<Vec<UserRecord>, ProviderError> {
        self.store.get_all_users().await
    }

    async fn find_groups(&self, filter: &str) -> Result<Vec<GroupRecord>, ProviderError> {
        let member = Filter::parse(filter)
            .ok()
            .and_then(|f| f.asserted_value("memberUid").map(str::to_string));
        match member {
            Some(username) => self.store.find_groups_by_member_uid(&username).await,
            None => self.store.get_all_groups().await,
        }
    }

    async fn get_all_groups(&self) -> Result<Vec<GroupRecord>, ProviderError> {
        self.store.get_all_groups().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    async fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_user(
                UserRecord::new("ann", 1001, 1001),
                Some(StoredCredential {
                    password: hash_password("secret", "pepper"),
                    salt: Some("pepper".into()),
                }),
            )
            .await;
        store
            .insert_user(
                UserRecord::new("legacy", 1002, 1002),
                Some(StoredCredential {
                    password: "plaintext".into(),
                    salt: None,
                }),
            )
            .await;
        store
            .insert_group(GroupRecord::new("developers", 5000).with_members(["ann"]))
            .await;
        store.insert_group(GroupRecord::new("sysadmins", 5001)).await;
        store
    }

    #[test]
    fn test_hash_is_hex_sha512_length() {
        let h = hash_password("secret", "salt");
        assert_eq!(h.len(), PBKDF2_KEY_LEN * 2);
        assert_eq!(h, hash_password("secret", "salt"));
        assert_ne!(h, hash_password("secret", "other"));
    }

    #[tokio::test]
    async fn test_salted_and_plain_passwords() {
        let auth = DatabaseAuth::new(store().await);
        let ctx = BindContext::new("");
        assert!(auth.authenticate(&Credential::new("ann", "secret"), &ctx).await.unwrap());
        assert!(!auth.authenticate(&Credential::new("ann", "wrong"), &ctx).await.unwrap());
        assert!(auth.authenticate(&Credential::new("legacy", "plaintext"), &ctx).await.unwrap());
        assert!(!auth.authenticate(&Credential::new("nobody", "x"), &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_groups_by_member() {
        let dir = DatabaseDirectory::new(store().await);
        let groups = dir.find_groups("(&(objectClass=posixGroup)(memberUid=ann))").await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "developers");

        let all = dir.find_groups("(cn=sysadmins)").await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
