//! MySQL driver
//!
//! Schema: `users`, `groups` and the `user_groups` join table. Group
//! membership is aggregated with `GROUP_CONCAT`.

use super::{to_id, DirectoryStore, StoredCredential};
use async_trait::async_trait;
use ldap_gateway_core::{GroupRecord, ProviderError, UserRecord};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, warn};

const USER_COLUMNS: &str = "username, full_name, surname, mail, \
     CAST(uid_number AS SIGNED) AS uid_number, \
     CAST(gid_number AS SIGNED) AS gid_number, home_directory";

const GROUP_SELECT: &str = "SELECT g.name, CAST(g.gid AS SIGNED) AS gid, \
     GROUP_CONCAT(u.username ORDER BY u.username) AS member_uids \
     FROM `groups` g \
     LEFT JOIN user_groups ug ON g.id = ug.group_id \
     LEFT JOIN users u ON ug.user_id = u.id";

const GROUP_TAIL: &str = "GROUP BY g.id, g.name, g.gid ORDER BY g.name";

#[derive(Debug, FromRow)]
pub(crate) struct UserRow {
    username: String,
    full_name: Option<String>,
    surname: Option<String>,
    mail: Option<String>,
    uid_number: Option<i64>,
    gid_number: Option<i64>,
    home_directory: Option<String>,
}

impl UserRow {
    /// Stored ids are used as-is; a row without a usable id is skipped.
    fn into_record(self) -> Option<UserRecord> {
        let (Some(uid), Some(gid)) = (
            self.uid_number.and_then(to_id),
            self.gid_number.and_then(to_id),
        ) else {
            warn!("Skipping user {}: missing or invalid uid/gid", self.username);
            return None;
        };
        Some(UserRecord {
            username: self.username,
            display_name: self.full_name,
            surname: self.surname,
            email: self.mail,
            uid_number: uid,
            gid_number: gid,
            home_directory: self.home_directory,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct GroupRow {
    name: String,
    gid: Option<i64>,
    member_uids: Option<String>,
}

impl GroupRow {
    fn into_record(self) -> Option<GroupRecord> {
        let Some(gid) = self.gid.and_then(to_id) else {
            warn!("Skipping group {}: missing or invalid gid", self.name);
            return None;
        };
        let members = self
            .member_uids
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(String::from)
            .collect::<Vec<_>>();
        Some(GroupRecord::new(self.name, gid).with_members(members))
    }
}

#[derive(Debug, FromRow)]
struct CredentialRow {
    password: Option<String>,
    salt: Option<String>,
}

fn map_sqlx_error(e: sqlx::Error) -> ProviderError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ProviderError::unavailable(e)
        }
        other => ProviderError::backend(other),
    }
}

/// Connection pool wrapper.
#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(database_url: &str) -> Result<Self, ProviderError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        info!("MySQL connection pool established");
        Ok(Self { pool })
    }
}

#[async_trait]
impl DirectoryStore for MySqlStore {
    async fn find_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserRecord>, ProviderError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE username = ?",
            USER_COLUMNS
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.and_then(UserRow::into_record))
    }

    async fn get_all_users(&self) -> Result<Vec<UserRecord>, ProviderError> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users ORDER BY username",
            USER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().filter_map(UserRow::into_record).collect())
    }

    async fn find_groups_by_member_uid(
        &self,
        username: &str,
    ) -> Result<Vec<GroupRecord>, ProviderError> {
        let rows = sqlx::query_as::<_, GroupRow>(&format!(
            "{} WHERE g.id IN (\
                 SELECT ug2.group_id FROM user_groups ug2 \
                 JOIN users u2 ON ug2.user_id = u2.id WHERE u2.username = ?) {}",
            GROUP_SELECT, GROUP_TAIL
        ))
        .bind(username)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().filter_map(GroupRow::into_record).collect())
    }

    async fn get_all_groups(&self) -> Result<Vec<GroupRecord>, ProviderError> {
        let rows = sqlx::query_as::<_, GroupRow>(&format!("{} {}", GROUP_SELECT, GROUP_TAIL))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().filter_map(GroupRow::into_record).collect())
    }

    async fn find_credentials(
        &self,
        username: &str,
    ) -> Result<Option<StoredCredential>, ProviderError> {
        let row = sqlx::query_as::<_, CredentialRow>(
            "SELECT password, salt FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.and_then(|r| {
            r.password.map(|password| StoredCredential {
                password,
                salt: r.salt.filter(|s| !s.is_empty()),
            })
        }))
    }
}
