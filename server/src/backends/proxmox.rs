//! Proxmox VE flat-file backend
//!
//! Users and groups come from `user.cfg`, password hashes from
//! `shadow.cfg`. Both files are kept in memory and reloaded when they
//! change on disk.

use crate::watch::WatchedFile;
use async_trait::async_trait;
use ldap_gateway_core::{
    stable_id, AuthProvider, BindContext, Credential, DirectoryProvider, Filter, GroupRecord,
    Metrics, ProviderError, UserRecord,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Parsed `user.cfg`
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProxmoxUsers {
    pub users: Vec<UserRecord>,
    pub groups: Vec<GroupRecord>,
}

fn strip_realm(userid: &str) -> &str {
    userid.split('@').next().unwrap_or(userid).trim()
}

fn field<'a>(fields: &[&'a str], idx: usize) -> Option<&'a str> {
    fields
        .get(idx)
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
}

/// Parse the `user:` and `group:` lines of a Proxmox `user.cfg`.
///
/// `user:<userid>:<enable>:<expire>:<firstname>:<lastname>:<email>:<comment>:<keys>:`
/// `group:<name>:<members>:<comment>:`
pub fn parse_user_cfg(content: &str) -> Result<ProxmoxUsers, ProviderError> {
    let mut parsed = ProxmoxUsers::default();
    let mut seen = HashSet::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix("user:") {
            let fields: Vec<&str> = rest.split(':').collect();
            let username = field(&fields, 0).map(strip_realm).unwrap_or_default();
            if username.is_empty() {
                return Err(ProviderError::Parse(format!(
                    "user.cfg line {}: user entry without a name",
                    idx + 1
                )));
            }
            if field(&fields, 1) == Some("0") {
                debug!("Skipping disabled user {}", username);
                continue;
            }
            if !seen.insert(username.to_string()) {
                debug!("Duplicate user {} on line {}, keeping the first", username, idx + 1);
                continue;
            }

            let first = field(&fields, 3);
            let last = field(&fields, 4);
            let display_name = match (first, last) {
                (None, None) => None,
                (f, l) => Some(
                    [f, l]
                        .iter()
                        .flatten()
                        .copied()
                        .collect::<Vec<_>>()
                        .join(" "),
                ),
            };
            let id = stable_id(username);
            parsed.users.push(UserRecord {
                username: username.to_string(),
                display_name,
                surname: last.map(String::from),
                email: field(&fields, 5).map(String::from),
                uid_number: id,
                gid_number: id,
                home_directory: Some(format!("/home/{}", username)),
            });
        } else if let Some(rest) = line.strip_prefix("group:") {
            let fields: Vec<&str> = rest.split(':').collect();
            let Some(name) = field(&fields, 0) else {
                return Err(ProviderError::Parse(format!(
                    "user.cfg line {}: group entry without a name",
                    idx + 1
                )));
            };
            let members = field(&fields, 1)
                .unwrap_or_default()
                .split(',')
                .map(strip_realm)
                .filter(|m| !m.is_empty());
            parsed
                .groups
                .push(GroupRecord::new(name, stable_id(name)).with_members(members));
        }
    }

    Ok(parsed)
}

/// Parse `shadow.cfg` lines of the form `<username>:<crypt hash>`.
pub fn parse_shadow(content: &str) -> Result<HashMap<String, String>, ProviderError> {
    let mut hashes = HashMap::new();
    for line in content.lines() {
        let mut parts = line.trim().splitn(3, ':');
        let (Some(user), Some(hash)) = (parts.next(), parts.next()) else {
            continue;
        };
        let user = strip_realm(user);
        if user.is_empty() || hash.is_empty() {
            continue;
        }
        hashes
            .entry(user.to_string())
            .or_insert_with(|| hash.to_string());
    }
    Ok(hashes)
}

/// Check a password against a `$6$` or `$5$` crypt hash. Other schemes fail.
pub fn verify_crypt(password: &str, hash: &str) -> bool {
    if hash.starts_with("$6$") {
        sha_crypt::sha512_check(password, hash).is_ok()
    } else if hash.starts_with("$5$") {
        sha_crypt::sha256_check(password, hash).is_ok()
    } else {
        warn!("Unsupported password hash scheme in shadow file");
        false
    }
}

/// Poll interval and quiet period for the file watch
#[derive(Debug, Clone, Copy)]
pub struct ReloadSettings {
    pub poll: Duration,
    pub quiet: Duration,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            poll: crate::watch::DEFAULT_POLL_INTERVAL,
            quiet: crate::watch::DEFAULT_QUIET_PERIOD,
        }
    }
}

pub struct ProxmoxDirectory {
    file: Arc<WatchedFile<ProxmoxUsers>>,
    watch: JoinHandle<()>,
}

impl ProxmoxDirectory {
    pub async fn open(
        path: impl Into<PathBuf>,
        reload: ReloadSettings,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, ProviderError> {
        let mut file = WatchedFile::load(path, "proxmox_user_cfg", parse_user_cfg).await?;
        if let Some(m) = metrics {
            file = file.with_metrics(m);
        }
        let file = Arc::new(file);
        let watch = file.watch(reload.poll, reload.quiet);
        Ok(Self {
            file,
            watch,
        })
    }
}

impl Drop for ProxmoxDirectory {
    fn drop(&mut self) {
        self.watch.abort();
    }
}

#[async_trait]
impl DirectoryProvider for ProxmoxDirectory {
    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, ProviderError> {
        let data = self.file.current().await;
        Ok(data.users.iter().find(|u| u.username == username).cloned())
    }

    async fn get_all_users(&self) -> Result<Vec<UserRecord>, ProviderError> {
        Ok(self.file.current().await.users.clone())
    }

    async fn find_groups(&self, filter: &str) -> Result<Vec<GroupRecord>, ProviderError> {
        let data = self.file.current().await;
        let Ok(parsed) = Filter::parse(filter) else {
            debug!("Unparseable group filter {}", filter);
            return Ok(Vec::new());
        };

        if let Some(member) = parsed.asserted_value("memberUid") {
            return Ok(data
                .groups
                .iter()
                .filter(|g| g.has_member(member))
                .cloned()
                .collect());
        }
        if let Some(name) = parsed.asserted_value("cn") {
            return Ok(data.groups.iter().filter(|g| g.name == name).cloned().collect());
        }
        if parsed.asserts_any("objectClass", &["posixGroup"]) || parsed.mentions("gidNumber") {
            return Ok(data.groups.clone());
        }
        Ok(Vec::new())
    }

    async fn get_all_groups(&self) -> Result<Vec<GroupRecord>, ProviderError> {
        Ok(self.file.current().await.groups.clone())
    }
}

pub struct ProxmoxAuth {
    file: Arc<WatchedFile<HashMap<String, String>>>,
    watch: JoinHandle<()>,
}

impl ProxmoxAuth {
    pub async fn open(
        path: impl Into<PathBuf>,
        reload: ReloadSettings,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, ProviderError> {
        let mut file = WatchedFile::load(path, "proxmox_shadow_cfg", parse_shadow).await?;
        if let Some(m) = metrics {
            file = file.with_metrics(m);
        }
        let file = Arc::new(file);
        let watch = file.watch(reload.poll, reload.quiet);
        Ok(Self {
            file,
            watch,
        })
    }
}

impl Drop for ProxmoxAuth {
    fn drop(&mut self) {
        self.watch.abort();
    }
}

#[async_trait]
impl AuthProvider for ProxmoxAuth {
    async fn authenticate(
        &self,
        credential: &Credential,
        _context: &BindContext,
    ) -> Result<bool, ProviderError> {
        let hashes = self.file.current().await;
        match hashes.get(credential.username()) {
            Some(hash) => Ok(verify_crypt(credential.password(), hash)),
            None => {
                debug!("{} not present in shadow file", credential.username());
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha_crypt::{sha512_simple, Sha512Params};

    const USER_CFG: &str = "\
user:root@pam:1:0:::root@example.com:::
user:ann@pve:1:0:Ann:Example:ann@example.com:Ops::
user:ann@pam:1:0:Other:Ann:other@example.com:::
user:old@pve:0:0:Old:Timer::::
user:bob@pve:1:0::::::
token:ann@pve!ci:0:1::
group:admins:root@pam,ann@pve:Administrators:
group:empty::No members:

acl:1:/:@admins:Administrator:
";

    #[test]
    fn test_parse_users_and_groups() {
        let parsed = parse_user_cfg(USER_CFG).unwrap();
        let names: Vec<_> = parsed.users.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["root", "ann", "bob"]);

        let ann = &parsed.users[1];
        assert_eq!(ann.display_name.as_deref(), Some("Ann Example"));
        assert_eq!(ann.surname.as_deref(), Some("Example"));
        assert_eq!(ann.email.as_deref(), Some("ann@example.com"));
        assert_eq!(ann.uid_number, stable_id("ann"));
        assert_eq!(ann.home_directory.as_deref(), Some("/home/ann"));

        let bob = &parsed.users[2];
        assert!(bob.display_name.is_none());
        assert!(bob.email.is_none());

        assert_eq!(parsed.groups.len(), 2);
        assert!(parsed.groups[0].has_member("root"));
        assert!(parsed.groups[0].has_member("ann"));
        assert!(parsed.groups[1].member_uids.is_empty());
    }

    #[test]
    fn test_nameless_entries_are_errors() {
        assert!(matches!(
            parse_user_cfg("user::1:0::::::\n"),
            Err(ProviderError::Parse(_))
        ));
        assert!(matches!(
            parse_user_cfg("group::ann@pve::\n"),
            Err(ProviderError::Parse(_))
        ));
    }

    #[test]
    fn test_shadow_and_crypt() {
        let params = Sha512Params::new(5000).unwrap();
        let hash = sha512_simple("s3cret", &params).unwrap();
        let shadow = parse_shadow(&format!("ann:{}:\n\ngarbage\nbob@pve:$1$abc$def\n", hash)).unwrap();

        assert!(verify_crypt("s3cret", &shadow["ann"]));
        assert!(!verify_crypt("wrong", &shadow["ann"]));
        // md5-crypt is not accepted
        assert!(!verify_crypt("anything", &shadow["bob"]));
        assert!(!shadow.contains_key("garbage"));
    }

    async fn directory() -> (tempfile::TempDir, ProxmoxDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.cfg");
        std::fs::write(&path, USER_CFG).unwrap();
        let directory = ProxmoxDirectory::open(&path, ReloadSettings::default(), None)
            .await
            .unwrap();
        (dir, directory)
    }

    #[tokio::test]
    async fn test_find_groups_filter_shapes() {
        let (_dir, d) = directory().await;

        let groups = d.find_groups("(memberUid=ann)").await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "admins");

        let groups = d.find_groups("(cn=empty)").await.unwrap();
        assert_eq!(groups.len(), 1);

        assert_eq!(d.find_groups("(objectClass=posixGroup)").await.unwrap().len(), 2);
        assert_eq!(d.find_groups("(gidNumber=*)").await.unwrap().len(), 2);
        assert!(d.find_groups("(description=ops)").await.unwrap().is_empty());
        assert!(d.find_groups("(((").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_negated_member_is_not_a_match() {
        let (_dir, d) = directory().await;
        assert!(d.find_groups("(!(memberUid=ann))").await.unwrap().is_empty());
        // the positive objectClass term still selects every group
        let groups = d
            .find_groups("(&(objectClass=posixGroup)(!(memberUid=ann)))")
            .await
            .unwrap();
        assert_eq!(groups.len(), 2);
    }

    #[tokio::test]
    async fn test_find_user() {
        let (_dir, d) = directory().await;
        assert!(d.find_user("ann").await.unwrap().is_some());
        assert!(d.find_user("old").await.unwrap().is_none());
        assert_eq!(d.get_all_users().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_auth_against_shadow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shadow.cfg");
        let hash = sha512_simple("s3cret", &Sha512Params::new(5000).unwrap()).unwrap();
        std::fs::write(&path, format!("ann:{}:\n", hash)).unwrap();

        let auth = ProxmoxAuth::open(&path, ReloadSettings::default(), None)
            .await
            .unwrap();
        let ctx = BindContext::new("uid=ann,dc=example,dc=com");
        assert!(auth.authenticate(&Credential::new("ann", "s3cret"), &ctx).await.unwrap());
        assert!(!auth.authenticate(&Credential::new("ann", "nope"), &ctx).await.unwrap());
        assert!(!auth.authenticate(&Credential::new("eve", "s3cret"), &ctx).await.unwrap());
    }
}
