// Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use ldap_gateway_core::{
    AuthProvider, BindContext, Credential, DirectoryProvider, EngineConfig, GatewayEngine,
    GroupRecord, ProviderError, UserRecord,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

pub const BASE_DN: &str = "dc=example,dc=com";

/// Accepts `ann` / `secret` and `bob` / `hunter2`.
pub struct MemoryAuth;

#[async_trait]
impl AuthProvider for MemoryAuth {
    async fn authenticate(
        &self,
        credential: &Credential,
        _context: &BindContext,
    ) -> Result<bool, ProviderError> {
        Ok(matches!(
            (credential.username(), credential.password()),
            ("ann", "secret") | ("bob", "hunter2")
        ))
    }
}

pub struct MemoryDirectory {
    pub users: Vec<UserRecord>,
    pub groups: Vec<GroupRecord>,
}

impl MemoryDirectory {
    pub fn sample() -> Self {
        let mut ann = UserRecord::new("ann", 10001, 10001);
        ann.display_name = Some("Ann Example".to_string());
        let bob = UserRecord::new("bob", 10002, 10002);
        Self {
            users: vec![ann, bob],
            groups: vec![
                GroupRecord::new("ops", 5000).with_members(["ann"]),
                GroupRecord::new("dev", 5001).with_members(["ann", "bob"]),
            ],
        }
    }
}

#[async_trait]
impl DirectoryProvider for MemoryDirectory {
    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, ProviderError> {
        Ok(self.users.iter().find(|u| u.username == username).cloned())
    }

    async fn get_all_users(&self) -> Result<Vec<UserRecord>, ProviderError> {
        Ok(self.users.clone())
    }

    async fn find_groups(&self, filter: &str) -> Result<Vec<GroupRecord>, ProviderError> {
        let member = filter
            .split("memberUid=")
            .nth(1)
            .and_then(|rest| rest.split(')').next())
            .unwrap_or_default();
        Ok(self
            .groups
            .iter()
            .filter(|g| g.has_member(member))
            .cloned()
            .collect())
    }

    async fn get_all_groups(&self) -> Result<Vec<GroupRecord>, ProviderError> {
        Ok(self.groups.clone())
    }
}

pub fn loopback_config() -> EngineConfig {
    EngineConfig {
        base_dn: BASE_DN.to_string(),
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        tls: None,
    }
}

pub fn sample_engine(config: EngineConfig) -> GatewayEngine {
    GatewayEngine::new(config)
        .with_auth_provider(Arc::new(MemoryAuth))
        .with_directory_provider(Arc::new(MemoryDirectory::sample()))
}

pub fn ldap_url(engine: &GatewayEngine, scheme: &str) -> String {
    let addr = engine.local_addr().expect("engine not started");
    format!("{}://{}", scheme, addr)
}
