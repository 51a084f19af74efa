//! TLS material for the LDAPS listener

use crate::error::GatewayError;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// PEM encoded certificate chain and private key.
#[derive(Clone)]
pub struct TlsMaterial {
    certificate_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("certificate_pem", &format!("{} bytes", self.certificate_pem.len()))
            .field("key_pem", &"[REDACTED]")
            .finish()
    }
}

impl TlsMaterial {
    pub fn from_pem(certificate_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            certificate_pem: certificate_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    /// Read both PEM files. A missing or unreadable file is a startup error.
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self, GatewayError> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                GatewayError::Startup(format!("cannot read {}: {}", path.display(), e))
            })
        };
        Ok(Self::from_pem(read(cert_path)?, read(key_path)?))
    }

    pub fn server_config(&self) -> Result<Arc<ServerConfig>, GatewayError> {
        let certs = parse_certificates(&self.certificate_pem)?;
        let key = parse_private_key(&self.key_pem)?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| GatewayError::Startup(format!("invalid TLS material: {}", e)))?;
        Ok(Arc::new(config))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, GatewayError> {
        Ok(TlsAcceptor::from(self.server_config()?))
    }
}

fn parse_certificates(pem_bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>, GatewayError> {
    let blocks = pem::parse_many(pem_bytes)
        .map_err(|e| GatewayError::Startup(format!("invalid certificate PEM: {}", e)))?;
    let certs: Vec<_> = blocks
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| CertificateDer::from(p.into_contents()))
        .collect();
    if certs.is_empty() {
        return Err(GatewayError::Startup(
            "no certificate found in TLS material".to_string(),
        ));
    }
    Ok(certs)
}

fn parse_private_key(pem_bytes: &[u8]) -> Result<PrivateKeyDer<'static>, GatewayError> {
    let blocks = pem::parse_many(pem_bytes)
        .map_err(|e| GatewayError::Startup(format!("invalid key PEM: {}", e)))?;
    blocks
        .into_iter()
        .find_map(|p| match p.tag() {
            "PRIVATE KEY" => Some(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                p.into_contents(),
            ))),
            "RSA PRIVATE KEY" => Some(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(
                p.into_contents(),
            ))),
            "EC PRIVATE KEY" => Some(PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(
                p.into_contents(),
            ))),
            _ => None,
        })
        .ok_or_else(|| GatewayError::Startup("no private key found in TLS material".to_string()))
}
