//! Error taxonomy
//!
//! Backend adapters raise [`ProviderError`]; the engine normalizes every
//! failure into a [`GatewayError`] which maps to exactly one LDAP result code.

use ldap3_proto::proto::LdapResultCode;
use std::io;
use thiserror::Error;

/// Failure raised by an auth or directory backend.
///
/// A wrong password is never an error: `AuthProvider::authenticate`
/// returns `Ok(false)` for it.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Backend or network unreachable, connection refused, timeouts
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// Unexpected backend failure (query error, driver error)
    #[error("backend error: {0}")]
    Backend(String),
    /// Backend data could not be parsed
    #[error("parse error: {0}")]
    Parse(String),
    /// Requested object is absent
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProviderError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        ProviderError::Backend(err.to_string())
    }

    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        ProviderError::Unavailable(err.to_string())
    }
}

/// Errors visible at the gateway boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("startup error: {0}")]
    Startup(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("operations error: {0}")]
    Operations(String),
    #[error("no such object: {0}")]
    NoSuchObject(String),
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
}

impl GatewayError {
    /// LDAP result code sent to the client.
    pub fn result_code(&self) -> LdapResultCode {
        match self {
            GatewayError::InvalidCredentials => LdapResultCode::InvalidCredentials,
            GatewayError::Unavailable(_) | GatewayError::Startup(_) => LdapResultCode::Unavailable,
            GatewayError::NoSuchObject(_) => LdapResultCode::NoSuchObject,
            GatewayError::Configuration(_)
            | GatewayError::Operations(_)
            | GatewayError::UnknownBackend(_) => LdapResultCode::OperationsError,
        }
    }

    /// Message placed in the LDAP result. Internal detail stays in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            GatewayError::InvalidCredentials => "Invalid credentials",
            GatewayError::Unavailable(_) | GatewayError::Startup(_) => "Service unavailable",
            GatewayError::NoSuchObject(_) => "Object not found",
            GatewayError::Configuration(_)
            | GatewayError::Operations(_)
            | GatewayError::UnknownBackend(_) => "Operations error",
        }
    }

    /// Normalize a backend failure raised while authenticating.
    pub fn from_bind_failure(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(msg) => GatewayError::Unavailable(msg),
            ProviderError::Io(e) if is_unreachable(&e) => GatewayError::Unavailable(e.to_string()),
            other => GatewayError::Operations(other.to_string()),
        }
    }

    /// Normalize a backend failure raised while searching.
    pub fn from_search_failure(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(msg) => GatewayError::Unavailable(msg),
            ProviderError::NotFound(msg) => GatewayError::NoSuchObject(msg),
            ProviderError::Io(e) if is_unreachable(&e) => GatewayError::Unavailable(e.to_string()),
            other => GatewayError::Operations(other.to_string()),
        }
    }

    /// Normalize a listener bind failure.
    pub fn from_listen_error(err: &io::Error, port: u16) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => {
                GatewayError::Startup(format!("port {} is already in use", port))
            }
            io::ErrorKind::PermissionDenied => {
                GatewayError::Startup(format!("permission denied to bind to port {}", port))
            }
            io::ErrorKind::NotFound => GatewayError::Startup("required files not found".to_string()),
            _ => GatewayError::Startup(format!("cannot listen on port {}: {}", port, err)),
        }
    }
}

fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NotConnected
    )
}
