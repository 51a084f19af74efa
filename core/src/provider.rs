//! Provider contracts
//!
//! Every backend implements one or both of these traits. The engine only
//! talks to `Arc<dyn AuthProvider>` / `Arc<dyn DirectoryProvider>`.

use crate::error::ProviderError;
use crate::model::{BindContext, Credential, GroupRecord, UserRecord};
use async_trait::async_trait;

/// Verifies credentials.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// `Ok(false)` for a rejected credential, `Err` when the backend failed.
    async fn authenticate(
        &self,
        credential: &Credential,
        context: &BindContext,
    ) -> Result<bool, ProviderError>;
}

/// Answers user and group lookups.
#[async_trait]
pub trait DirectoryProvider: Send + Sync {
    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, ProviderError>;

    async fn get_all_users(&self) -> Result<Vec<UserRecord>, ProviderError>;

    /// Groups matching an LDAP filter string such as `(memberUid=ann)`.
    async fn find_groups(&self, filter: &str) -> Result<Vec<GroupRecord>, ProviderError>;

    async fn get_all_groups(&self) -> Result<Vec<GroupRecord>, ProviderError>;
}
