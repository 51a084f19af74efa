//! MongoDB driver
//!
//! Collections `users` and `groups`; groups carry their members in a
//! `member_uids` array of usernames.

use super::{to_id, DirectoryStore, StoredCredential};
use async_trait::async_trait;
use futures::TryStreamExt;
use ldap_gateway_core::{GroupRecord, ProviderError, UserRecord};
use mongodb::bson::doc;
use mongodb::error::ErrorKind;
use mongodb::{Client, Collection, Database};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct UserDocument {
    username: String,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    surname: Option<String>,
    #[serde(default, alias = "mail")]
    email: Option<String>,
    #[serde(default)]
    uid_number: Option<i64>,
    #[serde(default)]
    gid_number: Option<i64>,
    #[serde(default)]
    home_directory: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    salt: Option<String>,
}

impl UserDocument {
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
            email: self.email,
            uid_number: uid,
            gid_number: gid,
            home_directory: self.home_directory,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GroupDocument {
    name: String,
    #[serde(default)]
    gid: Option<i64>,
    #[serde(default)]
    member_uids: Vec<String>,
}

impl GroupDocument {
    fn into_record(self) -> Option<GroupRecord> {
        let Some(gid) = self.gid.and_then(to_id) else {
            warn!("Skipping group {}: missing or invalid gid", self.name);
            return None;
        };
        Some(GroupRecord::new(self.name, gid).with_members(self.member_uids))
    }
}

fn map_mongo_error(e: mongodb::error::Error) -> ProviderError {
    let unreachable = matches!(
        e.kind.as_ref(),
        ErrorKind::ServerSelection { .. } | ErrorKind::Io(_)
    );
    if unreachable {
        ProviderError::unavailable(e)
    } else {
        ProviderError::backend(e)
    }
}

pub struct MongoStore {
    database: Database,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, ProviderError> {
        let client = Client::with_uri_str(uri).await.map_err(map_mongo_error)?;
        info!("MongoDB client ready, database {}", database);
        Ok(Self {
            database: client.database(database),
        })
    }

    fn users(&self) -> Collection<UserDocument> {
        self.database.collection("users")
    }

    fn groups(&self) -> Collection<GroupDocument> {
        self.database.collection("groups")
    }
}

#[async_trait]
impl DirectoryStore for MongoStore {
    async fn find_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserRecord>, ProviderError> {
        let found = self
            .users()
            .find_one(doc! { "username": username }, None)
            .await
            .map_err(map_mongo_error)?;
        Ok(found.and_then(UserDocument::into_record))
    }

    async fn get_all_users(&self) -> Result<Vec<UserRecord>, ProviderError> {
        let docs: Vec<UserDocument> = self
            .users()
            .find(doc! {}, None)
            .await
            .map_err(map_mongo_error)?
            .try_collect()
            .await
            .map_err(map_mongo_error)?;
        Ok(docs.into_iter().filter_map(UserDocument::into_record).collect())
    }

    async fn find_groups_by_member_uid(
        &self,
        username: &str,
    ) -> Result<Vec<GroupRecord>, ProviderError> {
        let docs: Vec<GroupDocument> = self
            .groups()
            .find(doc! { "member_uids": username }, None)
            .await
            .map_err(map_mongo_error)?
            .try_collect()
            .await
            .map_err(map_mongo_error)?;
        Ok(docs.into_iter().filter_map(GroupDocument::into_record).collect())
    }

    async fn get_all_groups(&self) -> Result<Vec<GroupRecord>, ProviderError> {
        let docs: Vec<GroupDocument> = self
            .groups()
            .find(doc! {}, None)
            .await
            .map_err(map_mongo_error)?
            .try_collect()
            .await
            .map_err(map_mongo_error)?;
        Ok(docs.into_iter().filter_map(GroupDocument::into_record).collect())
    }

    async fn find_credentials(
        &self,
        username: &str,
    ) -> Result<Option<StoredCredential>, ProviderError> {
        let found = self
            .users()
            .find_one(doc! { "username": username }, None)
            .await
            .map_err(map_mongo_error)?;
        Ok(found.and_then(|u| {
            u.password.map(|password| StoredCredential {
                password,
                salt: u.salt.filter(|s| !s.is_empty()),
            })
        }))
    }
}
