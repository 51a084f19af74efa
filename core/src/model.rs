//! Backend-neutral identity records

use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeSet;
use std::net::SocketAddr;

/// A POSIX user as seen by directory providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub display_name: Option<String>,
    pub surname: Option<String>,
    pub email: Option<String>,
    pub uid_number: u32,
    pub gid_number: u32,
    pub home_directory: Option<String>,
}

impl UserRecord {
    pub fn new(username: impl Into<String>, uid_number: u32, gid_number: u32) -> Self {
        Self {
            username: username.into(),
            display_name: None,
            surname: None,
            email: None,
            uid_number,
            gid_number,
            home_directory: None,
        }
    }
}

/// A POSIX group. Membership is by username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub name: String,
    pub gid_number: u32,
    pub member_uids: BTreeSet<String>,
    /// Distinguished name override; derived from the base DN when absent
    pub dn: Option<String>,
    /// Object classes override; `posixGroup` when empty
    pub object_classes: Vec<String>,
}

impl GroupRecord {
    pub fn new(name: impl Into<String>, gid_number: u32) -> Self {
        Self {
            name: name.into(),
            gid_number,
            member_uids: BTreeSet::new(),
            dn: None,
            object_classes: Vec::new(),
        }
    }

    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.member_uids.extend(members.into_iter().map(Into::into));
        self
    }

    pub fn has_member(&self, username: &str) -> bool {
        self.member_uids.contains(username)
    }
}

/// Username and password supplied with a simple bind.
#[derive(Debug, Clone)]
pub struct Credential {
    username: String,
    password: SecretString,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

/// Connection facts handed to auth providers along with the credential.
#[derive(Debug, Clone)]
pub struct BindContext {
    pub dn: String,
    pub peer: Option<SocketAddr>,
    pub tls: bool,
}

impl BindContext {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            peer: None,
            tls: false,
        }
    }
}
