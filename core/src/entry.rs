//! Projection of backend records into protocol entries

use crate::model::{GroupRecord, UserRecord};
use ldap3_proto::proto::{LdapPartialAttribute, LdapSearchResultEntry};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const DEFAULT_LOGIN_SHELL: &str = "/bin/bash";
const USER_OBJECT_CLASSES: &[&str] = &["top", "posixAccount", "inetOrgPerson", "shadowAccount"];
const DEFAULT_GROUP_CLASS: &str = "posixGroup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Single(String),
    Multi(Vec<String>),
}

impl AttributeValue {
    pub fn values(&self) -> Vec<&str> {
        match self {
            AttributeValue::Single(v) => vec![v.as_str()],
            AttributeValue::Multi(vs) => vs.iter().map(String::as_str).collect(),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Single(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Single(v.to_string())
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(vs: Vec<String>) -> Self {
        AttributeValue::Multi(vs)
    }
}

/// A search result entry before encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolEntry {
    pub dn: String,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl ProtocolEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Attribute lookup, ignoring case in the name.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// First value of an attribute.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.values().first().copied())
    }

    /// Keep only requested attributes. Empty or `*` keeps everything.
    pub fn select(mut self, requested: &[String]) -> Self {
        if requested.is_empty() || requested.iter().any(|a| a == "*") {
            return self;
        }
        self.attributes
            .retain(|name, _| requested.iter().any(|r| r.eq_ignore_ascii_case(name)));
        self
    }

    pub fn into_search_entry(self) -> LdapSearchResultEntry {
        let attributes = self
            .attributes
            .into_iter()
            .map(|(atype, value)| {
                let vals = match value {
                    AttributeValue::Single(v) => vec![v.into_bytes()],
                    AttributeValue::Multi(vs) => vs.into_iter().map(String::into_bytes).collect(),
                };
                LdapPartialAttribute { atype, vals }
            })
            .collect();
        LdapSearchResultEntry {
            dn: self.dn,
            attributes,
        }
    }
}

/// Domain used for fallback mail addresses: the `dc=` components of the
/// base DN joined with dots, or `localhost` when there are none.
pub fn domain_from_base_dn(base_dn: &str) -> String {
    let parts: Vec<&str> = base_dn
        .split(',')
        .filter_map(|rdn| {
            let (attr, value) = rdn.trim().split_once('=')?;
            attr.trim()
                .eq_ignore_ascii_case("dc")
                .then(|| value.trim())
        })
        .filter(|v| !v.is_empty())
        .collect();
    if parts.is_empty() {
        "localhost".to_string()
    } else {
        parts.join(".")
    }
}

/// Deterministic numeric id derived from a name, for backends that store none.
///
/// The first four bytes of SHA-256(name), big endian, reduced into
/// `10000..1_000_010_000` so it never collides with system accounts.
pub fn stable_id(name: &str) -> u32 {
    let digest = Sha256::digest(name.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    10_000 + prefix % 1_000_000_000
}

pub fn project_user(record: &UserRecord, base_dn: &str) -> ProtocolEntry {
    let name = record.username.as_str();
    let display = record
        .display_name
        .clone()
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| name.to_string());
    let surname = record
        .surname
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());
    let mail = record
        .email
        .clone()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("{}@{}", name, domain_from_base_dn(base_dn)));
    let home = record
        .home_directory
        .clone()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("/home/{}", name));

    ProtocolEntry::new(format!("uid={},{}", name, base_dn))
        .with(
            "objectClass",
            USER_OBJECT_CLASSES
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>(),
        )
        .with("uid", name)
        .with("uidNumber", record.uid_number.to_string())
        .with("gidNumber", record.gid_number.to_string())
        .with("cn", display.clone())
        .with("gecos", display)
        .with("sn", surname)
        .with("mail", mail)
        .with("homeDirectory", home)
        .with("loginShell", DEFAULT_LOGIN_SHELL)
        .with("shadowLastChange", "0")
}

pub fn project_group(record: &GroupRecord, base_dn: &str) -> ProtocolEntry {
    let dn = record
        .dn
        .clone()
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| format!("cn={},{}", record.name, base_dn));
    let classes = if record.object_classes.is_empty() {
        vec![DEFAULT_GROUP_CLASS.to_string()]
    } else {
        record.object_classes.clone()
    };

    let mut entry = ProtocolEntry::new(dn)
        .with("objectClass", classes)
        .with("cn", record.name.as_str())
        .with("gidNumber", record.gid_number.to_string());
    if !record.member_uids.is_empty() {
        entry = entry.with(
            "memberUid",
            record.member_uids.iter().cloned().collect::<Vec<_>>(),
        );
    }
    entry
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "dc=example,dc=com";

    #[test]
    fn test_project_user_defaults() {
        let user = UserRecord::new("ann", 10001, 10001);
        let entry = project_user(&user, BASE);

        assert_eq!(entry.dn, "uid=ann,dc=example,dc=com");
        assert_eq!(entry.first("mail"), Some("ann@example.com"));
        assert_eq!(entry.first("cn"), Some("ann"));
        assert_eq!(entry.first("gecos"), Some("ann"));
        assert_eq!(entry.first("sn"), Some("Unknown"));
        assert_eq!(entry.first("homeDirectory"), Some("/home/ann"));
        assert_eq!(entry.first("loginShell"), Some("/bin/bash"));
        assert_eq!(entry.first("uidNumber"), Some("10001"));
        assert_eq!(
            entry.get("objectClass").unwrap().values(),
            vec!["top", "posixAccount", "inetOrgPerson", "shadowAccount"]
        );
    }

    #[test]
    fn test_project_user_uses_record_fields() {
        let mut user = UserRecord::new("bob", 2000, 100);
        user.display_name = Some("Bob Builder".into());
        user.surname = Some("Builder".into());
        user.email = Some("bob@corp.test".into());
        user.home_directory = Some("/srv/bob".into());
        let entry = project_user(&user, BASE);

        assert_eq!(entry.first("cn"), Some("Bob Builder"));
        assert_eq!(entry.first("sn"), Some("Builder"));
        assert_eq!(entry.first("mail"), Some("bob@corp.test"));
        assert_eq!(entry.first("homeDirectory"), Some("/srv/bob"));
    }

    #[test]
    fn test_domain_derivation() {
        assert_eq!(domain_from_base_dn("dc=a,dc=b,dc=c"), "a.b.c");
        assert_eq!(domain_from_base_dn("ou=people, DC=corp, dc=io"), "corp.io");
        assert_eq!(domain_from_base_dn("o=acme"), "localhost");
    }

    #[test]
    fn test_project_group() {
        let group = GroupRecord::new("ops", 5000).with_members(["bob", "ann"]);
        let entry = project_group(&group, BASE);
        assert_eq!(entry.dn, "cn=ops,dc=example,dc=com");
        assert_eq!(entry.get("objectClass").unwrap().values(), vec!["posixGroup"]);
        assert_eq!(entry.get("memberUid").unwrap().values(), vec!["ann", "bob"]);

        let mut empty = GroupRecord::new("nobody", 5001);
        empty.dn = Some("cn=nobody,ou=groups,dc=example,dc=com".into());
        empty.object_classes = vec!["top".into(), "groupOfNames".into()];
        let entry = project_group(&empty, BASE);
        assert_eq!(entry.dn, "cn=nobody,ou=groups,dc=example,dc=com");
        assert!(entry.get("memberUid").is_none());
        assert_eq!(entry.get("objectClass").unwrap().values().len(), 2);
    }

    #[test]
    fn test_select_attributes() {
        let entry = project_user(&UserRecord::new("ann", 1, 1), BASE);
        let picked = entry
            .clone()
            .select(&["UID".to_string(), "mail".to_string()]);
        assert_eq!(picked.attributes.len(), 2);
        assert!(picked.get("uid").is_some());

        assert_eq!(entry.clone().select(&[]), entry);
        assert_eq!(entry.clone().select(&["*".to_string()]), entry);
    }

    #[test]
    fn test_stable_id_is_deterministic() {
        let a = stable_id("ann");
        assert_eq!(a, stable_id("ann"));
        assert_ne!(a, stable_id("bob"));
        assert!(a >= 10_000);
    }

    #[test]
    fn test_into_search_entry() {
        let group = GroupRecord::new("ops", 5000).with_members(["ann"]);
        let wire = project_group(&group, BASE).into_search_entry();
        assert_eq!(wire.dn, "cn=ops,dc=example,dc=com");
        let member = wire
            .attributes
            .iter()
            .find(|a| a.atype == "memberUid")
            .unwrap();
        assert_eq!(member.vals, vec![b"ann".to_vec()]);
    }
}
