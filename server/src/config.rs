//! Gateway settings
//!
//! Sources, first match wins per key:
//! 1. process environment
//! 2. `.env` in the working directory, or `/etc/ldap-gateway/.env`
//!
//! Keys are the usual upper-case environment names (`AUTH_BACKEND`,
//! `LDAP_BASE_DN`, ...). Values are validated once, in [`Settings::from_source`].

use ldap_gateway_core::{GatewayError, TlsMaterial};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const ENV_FILES: &[&str] = &[".env", "/etc/ldap-gateway/.env"];
const DEFAULT_USER_CFG: &str = "/etc/pve/user.cfg";
const DEFAULT_SHADOW_CFG: &str = "/etc/pve/priv/shadow.cfg";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings: {0}")]
    Source(#[from] config::ConfigError),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("{0} is required")]
    Missing(&'static str),
}

impl From<ConfigError> for GatewayError {
    fn from(e: ConfigError) -> Self {
        GatewayError::Configuration(e.to_string())
    }
}

/// Raw key/value view, every field optional.
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    auth_backend: Option<String>,
    directory_backend: Option<String>,
    ldap_common_name: Option<String>,
    ldap_base_dn: Option<String>,
    ldap_port: Option<String>,
    ldap_bind_address: Option<String>,
    ldap_cert_path: Option<String>,
    ldap_key_path: Option<String>,
    ldap_cert_content: Option<String>,
    ldap_key_content: Option<String>,
    ldap_unencrypted: Option<String>,
    proxmox_user_cfg: Option<String>,
    proxmox_shadow_cfg: Option<String>,
    enable_notification: Option<String>,
    notification_url: Option<String>,
    notification_timeout_secs: Option<String>,
    ad_domain: Option<String>,
    ldap_url: Option<String>,
    ldap_bind_dn: Option<String>,
    ldap_bind_password: Option<String>,
    ldap_search_base: Option<String>,
    ldap_lookup_attribute: Option<String>,
    ldap_upstream_timeout_secs: Option<String>,
    db_type: Option<String>,
    database_url: Option<String>,
    mongo_database: Option<String>,
    backend_dir: Option<String>,
    metrics_port: Option<String>,
    log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSettings {
    Disabled,
    Files { cert: PathBuf, key: PathBuf },
    Inline { cert: String, key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    MySql,
    MongoDb,
}

impl std::fmt::Display for DbType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbType::MySql => write!(f, "mysql"),
            DbType::MongoDb => write!(f, "mongodb"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub kind: DbType,
    pub url: Option<String>,
    pub mongo_database: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub ad_domain: Option<String>,
    pub url: Option<String>,
    pub bind_dn: Option<String>,
    pub bind_password: Option<SecretString>,
    pub search_base: String,
    pub lookup_attribute: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProxmoxSettings {
    pub user_cfg: PathBuf,
    pub shadow_cfg: PathBuf,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub auth_backend: String,
    pub directory_backend: String,
    pub common_name: String,
    pub base_dn: String,
    pub bind_address: IpAddr,
    pub port: u16,
    pub tls: TlsSettings,
    pub proxmox: ProxmoxSettings,
    pub notification: Option<NotificationSettings>,
    pub upstream: UpstreamSettings,
    pub database: DatabaseSettings,
    pub backend_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub log_level: String,
}

impl Settings {
    /// Load `.env` (first file found) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        for path in ENV_FILES {
            if Path::new(path).exists() && dotenvy::from_path(path).is_ok() {
                info!("Loaded configuration from {}", path);
                break;
            }
        }
        Self::from_source(config::Environment::default())
    }

    /// Build settings from an explicit key/value map instead of the process environment.
    pub fn from_map(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_source(config::Environment::default().source(Some(vars)))
    }

    fn from_source(env: config::Environment) -> Result<Self, ConfigError> {
        let raw: RawSettings = config::Config::builder()
            .add_source(env)
            .build()?
            .try_deserialize()?;
        Self::validate(raw)
    }

    fn validate(raw: RawSettings) -> Result<Self, ConfigError> {
        let common_name = non_empty(raw.ldap_common_name).unwrap_or_else(|| "localhost".to_string());
        let base_dn = non_empty(raw.ldap_base_dn).unwrap_or_else(|| base_dn_from_common_name(&common_name));

        let unencrypted = parse_flag(raw.ldap_unencrypted.as_deref());
        let tls = if unencrypted {
            TlsSettings::Disabled
        } else {
            match (
                non_empty(raw.ldap_cert_content),
                non_empty(raw.ldap_key_content),
                non_empty(raw.ldap_cert_path),
                non_empty(raw.ldap_key_path),
            ) {
                (Some(cert), Some(key), _, _) => TlsSettings::Inline { cert, key },
                (_, _, Some(cert), Some(key)) => TlsSettings::Files {
                    cert: PathBuf::from(cert),
                    key: PathBuf::from(key),
                },
                (Some(_), None, _, _) => return Err(ConfigError::Missing("LDAP_KEY_CONTENT")),
                (None, Some(_), _, _) => return Err(ConfigError::Missing("LDAP_CERT_CONTENT")),
                (_, _, Some(_), None) => return Err(ConfigError::Missing("LDAP_KEY_PATH")),
                (_, _, None, Some(_)) => return Err(ConfigError::Missing("LDAP_CERT_PATH")),
                (None, None, None, None) => TlsSettings::Disabled,
            }
        };

        let default_port = if tls == TlsSettings::Disabled { 389 } else { 636 };
        let port = parse_number("LDAP_PORT", raw.ldap_port)?.unwrap_or(default_port);

        let bind_address = match non_empty(raw.ldap_bind_address) {
            Some(addr) => addr.parse().map_err(|_| ConfigError::Invalid {
                key: "LDAP_BIND_ADDRESS",
                message: format!("'{}' is not an IP address", addr),
            })?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let notification = if parse_flag(raw.enable_notification.as_deref()) {
            let url = non_empty(raw.notification_url).ok_or(ConfigError::Missing("NOTIFICATION_URL"))?;
            let secs = parse_number("NOTIFICATION_TIMEOUT_SECS", raw.notification_timeout_secs)?
                .unwrap_or(25);
            Some(NotificationSettings {
                url,
                timeout: Duration::from_secs(secs),
            })
        } else {
            None
        };

        let upstream_timeout = parse_number("LDAP_UPSTREAM_TIMEOUT_SECS", raw.ldap_upstream_timeout_secs)?
            .unwrap_or(5);
        let upstream = UpstreamSettings {
            ad_domain: non_empty(raw.ad_domain),
            url: non_empty(raw.ldap_url),
            bind_dn: non_empty(raw.ldap_bind_dn),
            bind_password: non_empty(raw.ldap_bind_password).map(SecretString::new),
            search_base: non_empty(raw.ldap_search_base).unwrap_or_else(|| base_dn.clone()),
            lookup_attribute: non_empty(raw.ldap_lookup_attribute)
                .unwrap_or_else(|| "sAMAccountName".to_string()),
            timeout: Duration::from_secs(upstream_timeout),
        };

        let kind = match non_empty(raw.db_type).map(|t| t.to_ascii_lowercase()).as_deref() {
            None | Some("mysql") => DbType::MySql,
            Some("mongodb") | Some("mongo") => DbType::MongoDb,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "DB_TYPE",
                    message: format!("unsupported database type '{}'", other),
                })
            }
        };

        Ok(Settings {
            auth_backend: non_empty(raw.auth_backend).unwrap_or_else(|| "db".to_string()),
            directory_backend: non_empty(raw.directory_backend).unwrap_or_else(|| "db".to_string()),
            common_name,
            base_dn,
            bind_address,
            port,
            tls,
            proxmox: ProxmoxSettings {
                user_cfg: PathBuf::from(
                    non_empty(raw.proxmox_user_cfg).unwrap_or_else(|| DEFAULT_USER_CFG.to_string()),
                ),
                shadow_cfg: PathBuf::from(
                    non_empty(raw.proxmox_shadow_cfg)
                        .unwrap_or_else(|| DEFAULT_SHADOW_CFG.to_string()),
                ),
            },
            notification,
            upstream,
            database: DatabaseSettings {
                kind,
                url: non_empty(raw.database_url),
                mongo_database: non_empty(raw.mongo_database)
                    .unwrap_or_else(|| "ldap_user_db".to_string()),
            },
            backend_dir: PathBuf::from(
                non_empty(raw.backend_dir).unwrap_or_else(|| "./backends".to_string()),
            ),
            metrics_port: parse_number("METRICS_PORT", raw.metrics_port)?,
            log_level: non_empty(raw.log_level).unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Certificate and key for the listener, read from disk when configured by path.
    pub fn tls_material(&self) -> Result<Option<TlsMaterial>, GatewayError> {
        match &self.tls {
            TlsSettings::Disabled => Ok(None),
            TlsSettings::Files { cert, key } => TlsMaterial::from_files(cert, key).map(Some),
            TlsSettings::Inline { cert, key } => {
                Ok(Some(TlsMaterial::from_pem(cert.as_bytes(), key.as_bytes())))
            }
        }
    }
}

/// `example.com` -> `dc=example,dc=com`
pub fn base_dn_from_common_name(common_name: &str) -> String {
    common_name
        .split('.')
        .filter(|p| !p.is_empty())
        .map(|p| format!("dc={}", p))
        .collect::<Vec<_>>()
        .join(",")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("true") | Some("1") | Some("yes")
    )
}

fn parse_number<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
) -> Result<Option<T>, ConfigError> {
    match non_empty(value) {
        None => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|_| ConfigError::Invalid {
            key,
            message: format!("'{}' is not a valid number", v),
        }),
    }
}
