// Common test utilities

#![allow(dead_code)]

use ldap_gateway::config::Settings;
use sha_crypt::{sha512_simple, Sha512Params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const BASE_DN: &str = "dc=example,dc=com";

pub const USER_CFG: &str = "\
user:root@pam:1:0:::root@example.com:::
user:ann@pve:1:0:Ann:Example:ann@example.com:::
user:bob@pve:1:0:Bob:Builder::::
group:ops:ann@pve:Operations:
group:dev:ann@pve,bob@pve:Developers:
";

/// Loopback, plain LDAP on an ephemeral port.
pub fn base_vars() -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for (k, v) in [
        ("LDAP_UNENCRYPTED", "true"),
        ("LDAP_PORT", "0"),
        ("LDAP_BIND_ADDRESS", "127.0.0.1"),
        ("LDAP_BASE_DN", BASE_DN),
    ] {
        vars.insert(k.to_string(), v.to_string());
    }
    vars
}

pub fn settings(extra: &[(&str, &str)]) -> Arc<Settings> {
    let mut vars = base_vars();
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }
    Arc::new(Settings::from_map(vars).unwrap())
}

pub fn shadow_line(user: &str, password: &str) -> String {
    let params = Sha512Params::new(5000).unwrap();
    format!("{}:{}:\n", user, sha512_simple(password, &params).unwrap())
}

/// Writes `user.cfg` and `shadow.cfg` into `dir` and returns their paths.
pub fn write_proxmox_files(dir: &Path) -> (PathBuf, PathBuf) {
    let user_cfg = dir.join("user.cfg");
    let shadow_cfg = dir.join("shadow.cfg");
    std::fs::write(&user_cfg, USER_CFG).unwrap();
    let shadow = format!(
        "{}{}",
        shadow_line("ann@pve", "secret"),
        shadow_line("bob@pve", "hunter2")
    );
    std::fs::write(&shadow_cfg, shadow).unwrap();
    (user_cfg, shadow_cfg)
}

pub async fn connect(addr: std::net::SocketAddr) -> ldap3::Ldap {
    let (conn, ldap) = ldap3::LdapConnAsync::new(&format!("ldap://{}", addr))
        .await
        .unwrap();
    ldap3::drive!(conn);
    ldap
}

pub fn user_dn(name: &str) -> String {
    format!("uid={},{}", name, BASE_DN)
}
