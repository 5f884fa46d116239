use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use mineos_daemon::config::DaemonConfig;
use mineos_daemon::events::EventBus;
use mineos_daemon::host::{self, Host};
use mineos_daemon::identity::SystemIdentity;
use mineos_daemon::registry::ServerRegistry;
use mineos_daemon::supervisor::SupervisorOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::load()?;
    init_tracing(&config)?;
    tracing::info!("mineos daemon starting, base directory {}", config.base_directory.display());

    host::prepare_base(&config.base_directory)?;
    host::log_dependencies();

    let bus = EventBus::new();
    let registry = ServerRegistry::new(
        &config.base_directory,
        Arc::new(SystemIdentity),
        bus.clone(),
        SupervisorOptions::from_config(&config),
    );
    let report = registry.sync().await;
    tracing::info!("Tracking {} server(s)", report.added.len());

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    match registry.watch(cancel.clone()) {
        Ok(handle) => handles.push(handle),
        // 감시 없이도 시작 시점의 목록으로 계속 동작
        Err(e) => tracing::error!("Cannot watch servers directory: {}", e),
    }

    let host = Host::new(config, registry.clone());
    handles.extend(host.spawn_background(cancel.clone()));

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, cleaning up...");
    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    registry.shutdown().await;

    tracing::info!("mineos daemon stopped");
    Ok(())
}

/// stdout always; a second, plain-text layer when `log_file` is configured.
fn init_tracing(config: &DaemonConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}
