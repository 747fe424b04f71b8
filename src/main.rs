use std::sync::Arc;

use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use athena_ha::config::{self, HaConfig};
use athena_ha::driver::MySqlDriver;
use athena_ha::metrics::start_metrics_server;
use athena_ha::HaService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = load_or_default_config();

    let service = Arc::new(HaService::new(&config, Arc::new(MySqlDriver)));
    service.bootstrap(&config).await?;

    if !config.server.metrics_addr.is_empty() {
        let addr = config.server.metrics_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&addr).await {
                error!(addr = %addr, error = %e, "Metrics server failed");
            }
        });
    }

    if config.health.enabled {
        service.start_health_checking()?;
    } else {
        warn!("Health checking disabled; automatic failover will not see failures");
    }
    service.start_failover_monitor()?;

    info!(
        instances = config.instances.len(),
        clusters = config.clusters.len(),
        auto_failover = config.failover.auto_failover,
        "Athena HA running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");
    service.shutdown().await;

    Ok(())
}

fn load_or_default_config() -> HaConfig {
    // Try to load from config file
    let config_paths = ["config/athena-ha.toml", "athena-ha.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    HaConfig::default()
}
