use std::path::PathBuf;
use std::sync::Arc;

use companion_supervisor::config::{self, GlobalConfig, Overrides};
use companion_supervisor::control::FileInstallId;
use companion_supervisor::settings::{JsonSettingsStore, SettingsStore};
use companion_supervisor::ServerManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    tracing::info!("Companion host starting");

    let config_path = std::env::var("COMPANION_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(config::DEFAULT_CONFIG_PATH));
    let cfg = GlobalConfig::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load {}: {:#}, using defaults", config_path.display(), e);
        GlobalConfig::default()
    });

    let overrides = Overrides::from_args(std::env::args().skip(1));

    let settings_path = cfg.settings_path();
    let store: Arc<dyn SettingsStore> = match JsonSettingsStore::open(&settings_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(
                "Companion settings at {} unusable ({}), keeping them in memory",
                settings_path.display(),
                e
            );
            Arc::new(JsonSettingsStore::in_memory())
        }
    };

    let manager = ServerManager::builder(cfg.supervisor_config(&overrides), store)
        .overrides(overrides)
        .install_id_source(Arc::new(FileInstallId::new(cfg.install_id_path())))
        .spawn()?;

    manager.start().await?;

    shutdown_signal().await;

    if let Err(e) = manager.shutdown().await {
        tracing::error!("Supervisor did not shut down cleanly: {}", e);
    }
    tracing::info!("Companion host shutting down");
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM where there is one.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl-C received, stopping companion..."),
        _ = terminate => tracing::info!("SIGTERM received, stopping companion..."),
    }
}
