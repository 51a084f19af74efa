//! Storage drivers for the database backend
//!
//! Every driver exposes the same lookups; the database adapters never see
//! which store answers them.

mod memory;
mod mongo;
mod mysql;

pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use mysql::MySqlStore;

use crate::config::{DatabaseSettings, DbType};
use async_trait::async_trait;
use ldap_gateway_core::{GroupRecord, ProviderError, UserRecord};
use std::sync::Arc;
use tracing::info;

/// Password material stored for a user.
#[derive(Clone)]
pub struct StoredCredential {
    pub password: String,
    /// Present when `password` is a PBKDF2 digest
    pub salt: Option<String>,
}

impl std::fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredential")
            .field("password", &"[REDACTED]")
            .field("salted", &self.salt.is_some())
            .finish()
    }
}

#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn find_user_by_username(&self, username: &str)
        -> Result<Option<UserRecord>, ProviderError>;

    async fn get_all_users(&self) -> Result<Vec<UserRecord>, ProviderError>;

    async fn find_groups_by_member_uid(&self, username: &str)
        -> Result<Vec<GroupRecord>, ProviderError>;

    async fn get_all_groups(&self) -> Result<Vec<GroupRecord>, ProviderError>;

    async fn find_credentials(&self, username: &str)
        -> Result<Option<StoredCredential>, ProviderError>;
}

/// Open the driver selected by `DB_TYPE`.
pub async fn connect(settings: &DatabaseSettings) -> Result<Arc<dyn DirectoryStore>, ProviderError> {
    let url = settings
        .url
        .as_deref()
        .ok_or_else(|| ProviderError::Backend("DATABASE_URL is not set".to_string()))?;
    info!("Connecting to {} directory store", settings.kind);
    match settings.kind {
        DbType::MySql => Ok(Arc::new(MySqlStore::connect(url).await?)),
        DbType::MongoDb => Ok(Arc::new(
            MongoStore::connect(url, &settings.mongo_database).await?,
        )),
    }
}

/// Convert a stored numeric id, rejecting negatives and overflow.
pub(crate) fn to_id(value: i64) -> Option<u32> {
    u32::try_from(value).ok()
}
