//! Upstream server discovery
//!
//! With `AD_DOMAIN` set, every address record of the domain is a domain
//! controller on port 389. Otherwise `LDAP_URL` names a single server.

use crate::backends::upstream::{UpstreamScheme, UpstreamServer};
use crate::config::UpstreamSettings;
use ldap_gateway_core::ProviderError;
use std::collections::BTreeSet;
use tracing::info;
use url::Url;

pub async fn resolve_upstreams(
    settings: &UpstreamSettings,
) -> Result<Vec<UpstreamServer>, ProviderError> {
    let mut servers = match (&settings.ad_domain, &settings.url) {
        (Some(domain), _) => resolve_domain(domain).await?,
        (None, Some(url)) => vec![parse_upstream_url(url)?],
        (None, None) => {
            return Err(ProviderError::Backend(
                "AD_DOMAIN or LDAP_URL must be set for the ldap backend".to_string(),
            ))
        }
    };
    sort_upstreams(&mut servers);
    for s in &servers {
        info!(
            "Upstream {} (priority {}, weight {})",
            s.url(),
            s.priority,
            s.weight
        );
    }
    Ok(servers)
}

async fn resolve_domain(domain: &str) -> Result<Vec<UpstreamServer>, ProviderError> {
    let port = UpstreamScheme::Ldap.default_port();
    let addrs: BTreeSet<_> = tokio::net::lookup_host((domain, port))
        .await
        .map_err(|e| ProviderError::Unavailable(format!("cannot resolve {}: {}", domain, e)))?
        .map(|a| a.ip())
        .collect();
    if addrs.is_empty() {
        return Err(ProviderError::Unavailable(format!(
            "no domain controllers found for {}",
            domain
        )));
    }
    Ok(addrs
        .into_iter()
        .map(|ip| UpstreamServer::new(ip.to_string(), port, UpstreamScheme::Ldap))
        .collect())
}

pub fn parse_upstream_url(raw: &str) -> Result<UpstreamServer, ProviderError> {
    let url = Url::parse(raw).map_err(|e| ProviderError::Parse(format!("LDAP_URL: {}", e)))?;
    let scheme = match url.scheme() {
        "ldap" => UpstreamScheme::Ldap,
        "ldaps" => UpstreamScheme::Ldaps,
        other => {
            return Err(ProviderError::Parse(format!(
                "LDAP_URL: unsupported scheme '{}'",
                other
            )))
        }
    };
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProviderError::Parse("LDAP_URL: missing host".to_string()))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url.port().unwrap_or_else(|| scheme.default_port());
    Ok(UpstreamServer::new(host, port, scheme))
}

/// Ascending priority, then descending weight.
pub fn sort_upstreams(servers: &mut [UpstreamServer]) {
    servers.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
}
