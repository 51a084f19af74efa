//! LDAP gateway server
//!
//! Wires configuration, backends and the protocol engine from
//! `ldap-gateway-core` into a runnable service.

pub mod backends;
pub mod config;
pub mod db;
pub mod metrics_server;
pub mod notification;
pub mod registry;
pub mod resolver;
pub mod watch;

use config::Settings;
use ldap_gateway_core::{EngineConfig, GatewayEngine, GatewayError, Metrics, StepUpNotifier};
use notification::HttpNotifier;
use registry::ProviderRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Extra time the HTTP exchange gets beyond the step-up deadline, so the
/// deadline is what decides a slow approval.
const NOTIFY_HTTP_GRACE: Duration = Duration::from_secs(5);

/// Resolve both providers and assemble an engine ready to `start()`.
pub async fn build_engine(
    settings: &Settings,
    registry: &ProviderRegistry,
    metrics: Arc<Metrics>,
) -> Result<GatewayEngine, GatewayError> {
    let auth = registry.resolve_auth(&settings.auth_backend).await?;
    let directory = registry.resolve_directory(&settings.directory_backend).await?;

    let config = EngineConfig {
        base_dn: settings.base_dn.clone(),
        bind_address: settings.bind_address,
        port: settings.port,
        tls: settings.tls_material()?,
    };

    let mut engine = GatewayEngine::new(config)
        .with_auth_provider(auth)
        .with_directory_provider(directory)
        .with_metrics(metrics);

    if let Some(notification) = &settings.notification {
        let transport = HttpNotifier::new(&notification.url, notification.timeout + NOTIFY_HTTP_GRACE)
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;
        info!(
            "Step-up approval enabled via {} ({:?} deadline)",
            notification.url, notification.timeout
        );
        engine = engine.with_step_up(
            StepUpNotifier::new(Arc::new(transport)).with_deadline(notification.timeout),
        );
    }

    Ok(engine)
}
