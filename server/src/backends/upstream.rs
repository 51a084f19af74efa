//! Upstream LDAP failover pool
//!
//! Authenticates against an ordered list of directory servers (typically
//! Active Directory domain controllers). A server that fails is skipped
//! until the failure table is cleared, either by the periodic sweep or
//! because every server failed in one pass.

use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use ldap_gateway_core::{AuthProvider, BindContext, Credential, Metrics, ProviderError};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The whole failure table is cleared on this period.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Ldap,
    Ldaps,
}

impl UpstreamScheme {
    pub fn default_port(&self) -> u16 {
        match self {
            UpstreamScheme::Ldap => 389,
            UpstreamScheme::Ldaps => 636,
        }
    }
}

impl std::fmt::Display for UpstreamScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamScheme::Ldap => write!(f, "ldap"),
            UpstreamScheme::Ldaps => write!(f, "ldaps"),
        }
    }
}

/// One upstream directory server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamServer {
    pub host: String,
    pub port: u16,
    pub scheme: UpstreamScheme,
    pub priority: u16,
    pub weight: u16,
}

impl UpstreamServer {
    pub fn new(host: impl Into<String>, port: u16, scheme: UpstreamScheme) -> Self {
        Self {
            host: host.into(),
            port,
            scheme,
            priority: 0,
            weight: 100,
        }
    }

    /// Connection URL, also used as the failure table key.
    pub fn url(&self) -> String {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// Why one attempt against one server failed
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("service bind failed: {0}")]
    ServiceBind(String),
    #[error("user search failed: {0}")]
    Search(String),
    #[error("user not found")]
    UserNotFound,
    #[error("user bind rejected")]
    InvalidCredentials,
}

/// Performs the service-bind, lookup and user-bind sequence against one server.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn attempt(
        &self,
        server: &UpstreamServer,
        username: &str,
        password: &str,
    ) -> Result<(), UpstreamError>;
}

/// [`UpstreamConnector`] speaking LDAP through `ldap3`.
pub struct LdapConnector {
    bind_dn: Option<String>,
    bind_password: Option<SecretString>,
    search_base: String,
    lookup_attribute: String,
    timeout: Duration,
}

impl LdapConnector {
    pub fn new(
        bind_dn: Option<String>,
        bind_password: Option<SecretString>,
        search_base: impl Into<String>,
        lookup_attribute: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            bind_dn,
            bind_password,
            search_base: search_base.into(),
            lookup_attribute: lookup_attribute.into(),
            timeout,
        }
    }

    fn lookup_filter(&self, username: &str) -> String {
        format!("({}={})", self.lookup_attribute, ldap3::ldap_escape(username))
    }
}

#[async_trait]
impl UpstreamConnector for LdapConnector {
    async fn attempt(
        &self,
        server: &UpstreamServer,
        username: &str,
        password: &str,
    ) -> Result<(), UpstreamError> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &server.url())
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                debug!("Upstream connection closed: {}", e);
            }
        });

        if let (Some(dn), Some(pw)) = (&self.bind_dn, &self.bind_password) {
            ldap.with_timeout(self.timeout)
                .simple_bind(dn, pw.expose_secret())
                .await
                .and_then(|r| r.success())
                .map_err(|e| UpstreamError::ServiceBind(e.to_string()))?;
        }

        let (entries, _) = ldap
            .with_timeout(self.timeout)
            .search(
                &self.search_base,
                Scope::Subtree,
                &self.lookup_filter(username),
                vec!["dn"],
            )
            .await
            .and_then(|r| r.success())
            .map_err(|e| UpstreamError::Search(e.to_string()))?;

        let entry = entries.into_iter().next().ok_or(UpstreamError::UserNotFound)?;
        let user_dn = SearchEntry::construct(entry).dn;
        debug!("Resolved {} to {} on {}", username, user_dn, server.url());

        let result = ldap
            .with_timeout(self.timeout)
            .simple_bind(&user_dn, password)
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        if let Err(e) = ldap.unbind().await {
            debug!("Unbind from {} failed: {}", server.url(), e);
        }

        if result.rc == 0 {
            Ok(())
        } else {
            Err(UpstreamError::InvalidCredentials)
        }
    }
}

/// Ordered servers plus the shared failure table.
pub struct UpstreamLdapPool {
    servers: Vec<UpstreamServer>,
    connector: Arc<dyn UpstreamConnector>,
    failures: Arc<RwLock<HashMap<String, Instant>>>,
    metrics: Option<Arc<Metrics>>,
}

impl UpstreamLdapPool {
    pub fn new(servers: Vec<UpstreamServer>, connector: Arc<dyn UpstreamConnector>) -> Self {
        info!("Upstream pool with {} server(s)", servers.len());
        Self {
            servers,
            connector,
            failures: Arc::new(RwLock::new(HashMap::new())),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn servers(&self) -> &[UpstreamServer] {
        &self.servers
    }

    /// Clear the failure table every `period` until the pool is dropped.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let failures = Arc::downgrade(&self.failures);
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(failures) = failures.upgrade() else {
                    break;
                };
                let mut table = failures.write().await;
                if !table.is_empty() {
                    debug!("Clearing {} failed upstream server(s)", table.len());
                    table.clear();
                }
                if let Some(m) = &metrics {
                    m.upstream_failed_servers.set(0);
                }
            }
        })
    }

    pub async fn failed_servers(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.failures.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> Result<bool, ProviderError> {
        if self.servers.is_empty() {
            return Err(ProviderError::Unavailable(
                "no upstream servers configured".to_string(),
            ));
        }

        for server in &self.servers {
            let key = server.url();
            if self.failures.read().await.contains_key(&key) {
                debug!("Skipping recently failed upstream {}", key);
                continue;
            }

            match self.connector.attempt(server, username, password).await {
                Ok(()) => {
                    self.record_attempt(&key, "success");
                    info!("User {} authenticated via upstream {}", username, key);
                    return Ok(true);
                }
                Err(e) => {
                    warn!("Upstream {} failed for {}: {}", key, username, e);
                    self.record_attempt(&key, "failure");
                    let mut table = self.failures.write().await;
                    table.insert(key, Instant::now());
                    self.set_failed_gauge(table.len());
                }
            }
        }

        warn!("All upstream servers failed for {}, resetting failure table", username);
        self.failures.write().await.clear();
        self.set_failed_gauge(0);
        Ok(false)
    }

    fn record_attempt(&self, server: &str, result: &str) {
        if let Some(m) = &self.metrics {
            m.upstream_attempts_total
                .with_label_values(&[server, result])
                .inc();
        }
    }

    fn set_failed_gauge(&self, count: usize) {
        if let Some(m) = &self.metrics {
            m.upstream_failed_servers.set(count as i64);
        }
    }
}

/// Auth provider backed by the failover pool.
pub struct LdapAuthProvider {
    pool: Arc<UpstreamLdapPool>,
}

impl LdapAuthProvider {
    pub fn new(pool: Arc<UpstreamLdapPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuthProvider for LdapAuthProvider {
    async fn authenticate(
        &self,
        credential: &Credential,
        _context: &BindContext,
    ) -> Result<bool, ProviderError> {
        self.pool
            .authenticate(credential.username(), credential.password())
            .await
    }
}
