// Copyright (c) 2025 MCP Rust Contributors
// SPDX-License-Identifier: MIT

//! Plugin host binary
//!
//! Loads the host configuration, restores the plugins recorded in the
//! registry and serves the REST surface until Ctrl-C.

use clap::Parser;
use prism_plugin_host::core::logging;
use prism_plugin_host::plugin::runtime::BuiltinCatalog;
use prism_plugin_host::prelude::*;
use prism_plugin_host::server::PluginServer;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "prism-plugin-host", version, about = "Dynamic plugin host")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "PLUGIN_HOST_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the configuration
    #[arg(short, long)]
    bind: Option<String>,

    /// Plugin store directory, overrides the configuration
    #[arg(long)]
    plugin_dir: Option<PathBuf>,

    /// Skip restoring plugins from the registry
    #[arg(long)]
    no_restore: bool,
}

#[tokio::main]
async fn main() -> PluginResult<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => HostConfig::from_file(path).await?,
        None => HostConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(dir) = cli.plugin_dir {
        config.plugin_dir = dir;
    }
    config.validate()?;

    logging::init(&config.logging)?;
    info!(
        host_version = %config.host_version,
        plugin_dir = %config.plugin_dir.display(),
        "Starting plugin host"
    );

    let manager = PluginManager::open(config.clone(), BuiltinCatalog::new()).await?;
    if config.auto_load && !cli.no_restore {
        let report = manager.restore().await;
        for (id, reason) in &report.failed {
            warn!(plugin_id = %id, "Plugin not restored: {}", reason);
        }
    }

    let health = HealthReporter::new(manager.clone(), config.health.clone());
    health.start().await;

    #[cfg(feature = "watch")]
    let mut watcher = if config.hot_reload {
        let mut watcher = prism_plugin_host::plugin::watcher::PluginWatcher::new(manager.clone());
        watcher.start().await?;
        Some(watcher)
    } else {
        None
    };

    let server = PluginServer::new(manager.clone(), health.clone());
    server
        .serve(&config.bind_addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
        })
        .await?;

    #[cfg(feature = "watch")]
    if let Some(watcher) = watcher.as_mut() {
        watcher.stop().await;
    }
    health.stop().await;
    manager.shutdown().await;
    info!("Plugin host stopped");
    Ok(())
}
