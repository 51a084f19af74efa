use ldap_gateway::config::Settings;
use ldap_gateway::metrics_server::{bind_metrics, serve_metrics};
use ldap_gateway::registry::ProviderRegistry;
use ldap_gateway::build_engine;
use ldap_gateway_core::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Arc::new(Settings::load()?);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting ldap-gateway");
    info!("Auth backend: {}", settings.auth_backend);
    info!("Directory backend: {}", settings.directory_backend);
    info!("Base DN: {}", settings.base_dn);

    let metrics = Arc::new(Metrics::new().map_err(|e| e.to_string())?);
    let mut registry = ProviderRegistry::new(settings.clone()).with_metrics(metrics.clone());
    let loaded = registry.scan();
    let available = registry.available_backends();
    info!(
        "{} backend manifest(s) loaded; auth: [{}], directory: [{}]",
        loaded,
        available.auth.join(", "),
        available.directory.join(", ")
    );

    let mut engine = build_engine(&settings, &registry, metrics.clone()).await?;
    engine.start().await?;

    let shutdown = CancellationToken::new();
    let metrics_task = match settings.metrics_port {
        Some(port) => {
            let listener = bind_metrics(SocketAddr::new(settings.bind_address, port)).await?;
            Some(tokio::spawn(serve_metrics(listener, metrics, shutdown.clone())))
        }
        None => None,
    };

    wait_for_signal().await;
    info!("Shutting down");

    engine.stop().await;
    shutdown.cancel();
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    info!("Stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
