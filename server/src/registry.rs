//! Backend registry
//!
//! Backend names resolve to provider instances through named constructors.
//! Three constructors are compiled in (`db`, `ldap`, `proxmox`); an
//! embedding application can add more. Plugins give a constructor a new
//! name and options, either programmatically or through JSON manifests in
//! `BACKEND_DIR`:
//!
//! ```json
//! { "name": "pve-lab", "kind": "directory", "provider": "proxmox",
//!   "options": { "user_cfg": "/mnt/lab/user.cfg" } }
//! ```

use crate::backends::database::{DatabaseAuth, DatabaseDirectory};
use crate::backends::proxmox::{ProxmoxAuth, ProxmoxDirectory, ReloadSettings};
use crate::backends::upstream::{
    LdapAuthProvider, LdapConnector, UpstreamLdapPool, SWEEP_INTERVAL,
};
use crate::config::Settings;
use crate::db::{self, DirectoryStore};
use crate::resolver::resolve_upstreams;
use futures::future::BoxFuture;
use ldap_gateway_core::{AuthProvider, DirectoryProvider, GatewayError, Metrics, ProviderError};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BackendKind {
    Auth,
    Directory,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Auth => write!(f, "auth"),
            BackendKind::Directory => write!(f, "directory"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auth" => Ok(BackendKind::Auth),
            "directory" => Ok(BackendKind::Directory),
            other => Err(PluginError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin has no name")]
    MissingName,
    #[error("unknown plugin kind '{0}'")]
    UnknownKind(String),
    #[error("unknown constructor '{0}'")]
    UnknownConstructor(String),
    #[error("constructor '{constructor}' cannot build a {kind} provider")]
    MissingCapability {
        constructor: String,
        kind: BackendKind,
    },
    #[error("invalid manifest {path}: {message}")]
    Manifest { path: PathBuf, message: String },
}

/// Everything a constructor may need to build a provider.
#[derive(Clone)]
pub struct BackendContext {
    pub settings: Arc<Settings>,
    /// Per-plugin options; `Null` for compiled backends
    pub options: Value,
    pub metrics: Option<Arc<Metrics>>,
    pub reload: ReloadSettings,
    store: Arc<OnceCell<Arc<dyn DirectoryStore>>>,
}

impl BackendContext {
    /// Database store shared by every `db` provider in the process.
    pub async fn directory_store(&self) -> Result<Arc<dyn DirectoryStore>, ProviderError> {
        self.store
            .get_or_try_init(|| db::connect(&self.settings.database))
            .await
            .cloned()
    }

    /// String option, or `fallback` when absent.
    pub fn option_path(&self, key: &str, fallback: &Path) -> PathBuf {
        self.options
            .get(key)
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| fallback.to_path_buf())
    }
}

pub type AuthFactory = Arc<
    dyn Fn(BackendContext) -> BoxFuture<'static, Result<Arc<dyn AuthProvider>, ProviderError>>
        + Send
        + Sync,
>;
pub type DirectoryFactory = Arc<
    dyn Fn(BackendContext) -> BoxFuture<'static, Result<Arc<dyn DirectoryProvider>, ProviderError>>
        + Send
        + Sync,
>;

/// A named way of building providers; may cover one or both kinds.
#[derive(Clone, Default)]
pub struct Constructor {
    auth: Option<AuthFactory>,
    directory: Option<DirectoryFactory>,
}

impl Constructor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auth<F>(mut self, factory: F) -> Self
    where
        F: Fn(BackendContext) -> BoxFuture<'static, Result<Arc<dyn AuthProvider>, ProviderError>>
            + Send
            + Sync
            + 'static,
    {
        self.auth = Some(Arc::new(factory));
        self
    }

    pub fn with_directory<F>(mut self, factory: F) -> Self
    where
        F: Fn(BackendContext) -> BoxFuture<'static, Result<Arc<dyn DirectoryProvider>, ProviderError>>
            + Send
            + Sync
            + 'static,
    {
        self.directory = Some(Arc::new(factory));
        self
    }

    pub fn supports(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Auth => self.auth.is_some(),
            BackendKind::Directory => self.directory.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    Programmatic,
    Manifest(PathBuf),
}

/// A backend name bound to a constructor.
#[derive(Debug, Clone)]
pub struct BackendPlugin {
    pub name: String,
    pub kind: BackendKind,
    pub constructor: String,
    pub options: Value,
    pub source: PluginSource,
}

impl BackendPlugin {
    pub fn new(name: impl Into<String>, kind: BackendKind, constructor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            constructor: constructor.into(),
            options: Value::Null,
            source: PluginSource::Programmatic,
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(alias = "type")]
    kind: String,
    provider: String,
    #[serde(default)]
    options: Value,
}

/// Backend names per kind, compiled and plugin
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AvailableBackends {
    pub auth: Vec<String>,
    pub directory: Vec<String>,
}

pub struct ProviderRegistry {
    settings: Arc<Settings>,
    metrics: Option<Arc<Metrics>>,
    reload: ReloadSettings,
    constructors: BTreeMap<String, Constructor>,
    plugins: BTreeMap<(BackendKind, String), BackendPlugin>,
    store: Arc<OnceCell<Arc<dyn DirectoryStore>>>,
}

impl ProviderRegistry {
    pub fn new(settings: Arc<Settings>) -> Self {
        let mut constructors = BTreeMap::new();
        constructors.insert("db".to_string(), db_constructor());
        constructors.insert("ldap".to_string(), ldap_constructor());
        constructors.insert("proxmox".to_string(), proxmox_constructor());
        Self {
            settings,
            metrics: None,
            reload: ReloadSettings::default(),
            constructors,
            plugins: BTreeMap::new(),
            store: Arc::new(OnceCell::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_reload(mut self, reload: ReloadSettings) -> Self {
        self.reload = reload;
        self
    }

    pub fn register_constructor(&mut self, name: impl Into<String>, constructor: Constructor) {
        let name = name.into();
        info!("Registered backend constructor {}", name);
        self.constructors.insert(name, constructor);
    }

    pub fn validate(&self, plugin: &BackendPlugin) -> Result<(), PluginError> {
        if plugin.name.trim().is_empty() {
            return Err(PluginError::MissingName);
        }
        let constructor = self
            .constructors
            .get(&plugin.constructor)
            .ok_or_else(|| PluginError::UnknownConstructor(plugin.constructor.clone()))?;
        if !constructor.supports(plugin.kind) {
            return Err(PluginError::MissingCapability {
                constructor: plugin.constructor.clone(),
                kind: plugin.kind,
            });
        }
        Ok(())
    }

    pub fn register_plugin(&mut self, plugin: BackendPlugin) -> Result<(), PluginError> {
        self.validate(&plugin)?;
        info!(
            "Registered {} backend {} ({})",
            plugin.kind, plugin.name, plugin.constructor
        );
        self.plugins
            .insert((plugin.kind, plugin.name.clone()), plugin);
        Ok(())
    }

    /// Load manifests from `BACKEND_DIR`. Returns the number accepted.
    pub fn scan(&mut self) -> usize {
        let dir = self.settings.backend_dir.clone();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => {
                info!("Backend directory {} not found, skipping plugins", dir.display());
                return 0;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_manifest(p))
            .collect();
        paths.sort();

        let mut accepted = 0;
        for path in paths {
            match read_manifest(&path).and_then(|p| self.register_plugin(p)) {
                Ok(()) => accepted += 1,
                Err(e) => warn!("Skipping backend plugin {}: {}", path.display(), e),
            }
        }
        info!("Loaded {} backend plugin(s) from {}", accepted, dir.display());
        accepted
    }

    /// Drop manifest plugins and scan again. Programmatic plugins stay.
    pub fn rescan(&mut self) -> usize {
        self.plugins
            .retain(|_, p| p.source == PluginSource::Programmatic);
        self.scan()
    }

    pub fn available_backends(&self) -> AvailableBackends {
        let mut available = AvailableBackends::default();
        for (name, c) in &self.constructors {
            if c.supports(BackendKind::Auth) {
                available.auth.push(name.clone());
            }
            if c.supports(BackendKind::Directory) {
                available.directory.push(name.clone());
            }
        }
        for (kind, name) in self.plugins.keys() {
            let list = match kind {
                BackendKind::Auth => &mut available.auth,
                BackendKind::Directory => &mut available.directory,
            };
            if !list.contains(name) {
                list.push(name.clone());
            }
        }
        available.auth.sort();
        available.directory.sort();
        available
    }

    fn context(&self, options: Value) -> BackendContext {
        BackendContext {
            settings: self.settings.clone(),
            options,
            metrics: self.metrics.clone(),
            reload: self.reload,
            store: self.store.clone(),
        }
    }

    /// Plugin first, then compiled constructor of that name.
    fn lookup(&self, kind: BackendKind, name: &str) -> Option<(&Constructor, Value)> {
        if let Some(plugin) = self.plugins.get(&(kind, name.to_string())) {
            debug!("{} backend {} resolved to plugin", kind, name);
            let c = self.constructors.get(&plugin.constructor)?;
            return Some((c, plugin.options.clone()));
        }
        self.constructors.get(name).map(|c| (c, Value::Null))
    }

    pub async fn resolve_auth(&self, name: &str) -> Result<Arc<dyn AuthProvider>, GatewayError> {
        let (factory, options) = self
            .lookup(BackendKind::Auth, name)
            .and_then(|(c, o)| c.auth.clone().map(|f| (f, o)))
            .ok_or_else(|| GatewayError::UnknownBackend(format!("auth backend '{}'", name)))?;
        let provider = factory(self.context(options))
            .await
            .map_err(|e| GatewayError::Startup(format!("auth backend '{}': {}", name, e)))?;
        info!("Auth backend {} ready", name);
        Ok(provider)
    }

    pub async fn resolve_directory(
        &self,
        name: &str,
    ) -> Result<Arc<dyn DirectoryProvider>, GatewayError> {
        let (factory, options) = self
            .lookup(BackendKind::Directory, name)
            .and_then(|(c, o)| c.directory.clone().map(|f| (f, o)))
            .ok_or_else(|| {
                GatewayError::UnknownBackend(format!("directory backend '{}'", name))
            })?;
        let provider = factory(self.context(options))
            .await
            .map_err(|e| GatewayError::Startup(format!("directory backend '{}': {}", name, e)))?;
        info!("Directory backend {} ready", name);
        Ok(provider)
    }
}

fn is_manifest(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".json") && !name.contains(".example.") && name != "template.json"
}

fn read_manifest(path: &Path) -> Result<BackendPlugin, PluginError> {
    let invalid = |message: String| PluginError::Manifest {
        path: path.to_path_buf(),
        message,
    };
    let raw = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    let manifest: Manifest = serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?;
    let name = manifest
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or(PluginError::MissingName)?;
    Ok(BackendPlugin {
        name,
        kind: manifest.kind.parse()?,
        constructor: manifest.provider,
        options: manifest.options,
        source: PluginSource::Manifest(path.to_path_buf()),
    })
}

fn db_constructor() -> Constructor {
    Constructor::new()
        .with_auth(|ctx| {
            Box::pin(async move {
                let store = ctx.directory_store().await?;
                Ok::<_, ProviderError>(Arc::new(DatabaseAuth::new(store)) as Arc<dyn AuthProvider>)
            })
        })
        .with_directory(|ctx| {
            Box::pin(async move {
                let store = ctx.directory_store().await?;
                Ok::<_, ProviderError>(Arc::new(DatabaseDirectory::new(store)) as Arc<dyn DirectoryProvider>)
            })
        })
}

fn ldap_constructor() -> Constructor {
    Constructor::new().with_auth(|ctx| {
        Box::pin(async move {
            let upstream = &ctx.settings.upstream;
            let servers = resolve_upstreams(upstream).await?;
            let connector = LdapConnector::new(
                upstream.bind_dn.clone(),
                upstream.bind_password.clone(),
                upstream.search_base.clone(),
                upstream.lookup_attribute.clone(),
                upstream.timeout,
            );
            let mut pool = UpstreamLdapPool::new(servers, Arc::new(connector));
            if let Some(m) = &ctx.metrics {
                pool = pool.with_metrics(m.clone());
            }
            // the sweeper holds a weak reference and exits with the pool
            pool.spawn_sweeper(SWEEP_INTERVAL);
            Ok::<_, ProviderError>(Arc::new(LdapAuthProvider::new(Arc::new(pool))) as Arc<dyn AuthProvider>)
        })
    })
}

fn proxmox_constructor() -> Constructor {
    Constructor::new()
        .with_auth(|ctx| {
            Box::pin(async move {
                let path = ctx.option_path("shadow_cfg", &ctx.settings.proxmox.shadow_cfg);
                let auth = ProxmoxAuth::open(path, ctx.reload, ctx.metrics.clone()).await?;
                Ok::<_, ProviderError>(Arc::new(auth) as Arc<dyn AuthProvider>)
            })
        })
        .with_directory(|ctx| {
            Box::pin(async move {
                let path = ctx.option_path("user_cfg", &ctx.settings.proxmox.user_cfg);
                let dir = ProxmoxDirectory::open(path, ctx.reload, ctx.metrics.clone()).await?;
                Ok::<_, ProviderError>(Arc::new(dir) as Arc<dyn DirectoryProvider>)
            })
        })
}
