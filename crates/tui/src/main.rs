// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tunnel9 Contributors

// tunnel9 - Terminal UI
// Interactive manager for SSH local port forwards

mod app;
mod form;
mod logging;
mod runtime;
mod ui;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use tunnel9_common::{
    default_config_path, expand_path, parse_tags, select_auto_start, ConfigStore, Settings,
    TomlConfigStore,
};
use tunnel9_supervisor::{SshConnector, SupervisorOptions, TunnelSupervisor};

use app::AppState;
use runtime::Executor;

#[derive(Parser, Debug)]
#[command(name = "tunnel9")]
#[command(about = "Manage SSH tunnels from the terminal", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: $XDG_STATE_HOME/tunnel9/config.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Start tunnels with these comma-separated tags at launch ("all" for every tunnel)
    #[arg(short, long, value_name = "TAGS")]
    auto_start: Option<String>,

    /// Log file (default: tunnel9.log next to the config)
    #[arg(long, value_name = "PATH")]
    log_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(default_config_path);
    let config_dir = config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&config_dir).with_context(|| {
        format!("Failed to create config directory {}", config_dir.display())
    })?;

    let log_path = cli
        .log_file
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(|| config_dir.join("tunnel9.log"));
    logging::init(&log_path)?;

    info!("tunnel9 {} starting", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", config_path.display());

    let store = Arc::new(TomlConfigStore::new(&config_path));
    let (specs, settings, load_error) = match store.load() {
        Ok(config) => (config.tunnels, config.settings, None),
        Err(e) => {
            warn!("Failed to load config {}: {}", config_path.display(), e);
            (Vec::new(), Settings::default(), Some(e.to_string()))
        }
    };
    info!("Loaded {} tunnel(s)", specs.len());

    let (supervisor, tunnel_events) = TunnelSupervisor::new(
        Arc::new(SshConnector::new(&settings)),
        SupervisorOptions::from(&settings),
    );
    supervisor.register(&specs).await;

    let mut state = AppState::new(specs.clone(), store.location());
    if let Some(e) = load_error {
        state.error(format!("Config not loaded, saving is disabled: {}", e));
    }

    let (executor, results) = Executor::new(supervisor, store);

    let requested = cli.auto_start.as_deref().map(parse_tags).unwrap_or_default();
    let selected = select_auto_start(&specs, &requested, settings.tag_match);
    if !requested.is_empty() {
        info!(
            "Auto-start {:?} selected {} tunnel(s)",
            requested,
            selected.len()
        );
    }
    for command in state.auto_start(&selected) {
        executor.execute(command);
    }

    let mut terminal = runtime::setup_terminal()?;
    let result = runtime::run_loop(
        &mut terminal,
        &mut state,
        &executor,
        tunnel_events,
        results,
        settings.quit_timeout(),
    )
    .await;
    runtime::restore_terminal(&mut terminal)?;

    info!("tunnel9 exiting");
    result
}
