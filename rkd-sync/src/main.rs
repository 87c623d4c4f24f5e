//! rkd-sync - command-line driver for the sync engine
//!
//! Resolves configuration, opens the durable preference store under the root
//! folder, submits one identifier and prints live progress until the session
//! reaches a terminal state (or Ctrl+C).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rkd_common::config::{
    default_config_path, load_toml_config_or_default, write_toml_config, RootFolderInitializer,
    RootFolderResolver,
};
use rkd_common::events::EventBus;
use rkd_common::Variant;
use rkd_sync::preferences::FileStore;
use rkd_sync::providers::http::HttpCollaborators;
use rkd_sync::{Collaborators, EngineSettings, EngineView, SessionOrchestrator};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MODULE_NAME: &str = "rkd-sync";

/// Command-line arguments for rkd-sync
#[derive(Parser, Debug)]
#[command(name = "rkd-sync")]
#[command(about = "Streams player statistics with live progress")]
#[command(version)]
struct Args {
    /// Account to load statistics for
    #[arg(short, long)]
    identifier: Option<String>,

    /// Statistics variant (rapid, blitz); defaults to the stored preference
    #[arg(short, long)]
    variant: Option<Variant>,

    /// Root folder holding the preference store
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// TOML config file (default: ~/.config/rookdash/rkd-sync.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stats server base URL (overrides ENV and TOML)
    #[arg(long)]
    server_url: Option<String>,

    /// Mark onboarding complete before submitting
    #[arg(long)]
    onboarded: bool,

    /// Write a config file with compiled defaults if none exists, then exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .or_else(|| default_config_path(MODULE_NAME));
    let toml_config = load_toml_config_or_default(config_path.as_deref());

    // Initialize tracing: RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| toml_config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.init_config {
        let path = config_path.context("No config directory available on this platform")?;
        if path.exists() {
            warn!("Config file already exists: {}", path.display());
        } else {
            write_toml_config(&toml_config, &path).context("Failed to write config file")?;
            info!("Wrote default config to {}", path.display());
        }
        return Ok(());
    }

    info!("Starting rkd-sync");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut settings =
        EngineSettings::resolve(&toml_config).context("Invalid engine configuration")?;
    if let Some(url) = args.server_url.clone() {
        settings.server_url = url;
    }
    info!("Server: {}", settings.server_url);

    // Resolve and prepare root folder
    let root_folder = RootFolderResolver::new(MODULE_NAME)
        .with_cli_arg(args.root_folder.clone())
        .with_toml_config(toml_config.clone())
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .map_err(|e| anyhow::anyhow!("Failed to initialize root folder: {}", e))?;
    info!("Preference store: {}", initializer.state_dir().display());

    let store = Arc::new(FileStore::open(initializer.state_dir())?);
    let http = HttpCollaborators::new(&settings.server_url, settings.request_timeout)
        .context("Invalid server URL")?;

    let event_bus = EventBus::new(256);
    let orchestrator =
        SessionOrchestrator::new(settings, store, Collaborators::http(http), event_bus);
    orchestrator.start().await;

    let Some(identifier) = args.identifier else {
        info!("No identifier given, nothing to load");
        orchestrator.dispose();
        return Ok(());
    };

    if args.onboarded {
        orchestrator.complete_onboarding(None)?;
    }
    if let Some(variant) = args.variant {
        orchestrator.change_variant(variant)?;
    }

    let mut view = orchestrator.subscribe();
    orchestrator.set_candidate(&identifier);
    if !orchestrator.submit() {
        anyhow::bail!("Identifier must not be blank");
    }

    let outcome = tokio::select! {
        outcome = watch_until_settled(&mut view) => outcome,
        _ = shutdown_signal() => None,
    };
    orchestrator.dispose();

    match outcome {
        Some(view) => report(&view),
        None => info!("Interrupted"),
    }
    Ok(())
}

/// Print progress until the session ends or onboarding needs confirmation
async fn watch_until_settled(
    view: &mut tokio::sync::watch::Receiver<EngineView>,
) -> Option<EngineView> {
    let mut last_unit = None;
    let mut seen_loading = false;
    loop {
        {
            let current = view.borrow_and_update();
            if let Some(progress) = &current.progress {
                if last_unit != Some(progress.current_unit) {
                    last_unit = Some(progress.current_unit);
                    println!(
                        "[{:>5.1}%] {}/{} {}{}",
                        progress.percentage(),
                        progress.current_unit,
                        progress.total_units,
                        progress.current_label,
                        if progress.from_cache { " (cached)" } else { "" }
                    );
                }
            }
            seen_loading |= current.loading;
            let settled = seen_loading && !current.loading;
            if settled
                || current.error.is_some()
                || current.result.is_complete()
                || current.onboarding_summary.is_some()
            {
                return Some(current.clone());
            }
        }
        if view.changed().await.is_err() {
            return None;
        }
    }
}

fn report(view: &EngineView) {
    if let Some(error) = &view.error {
        println!("Error: {}", error);
        return;
    }
    if let Some(stats) = view.result.completed() {
        println!(
            "{} ({}){}",
            stats.entity.label(),
            stats.variant,
            if stats.from_cache { " [cached]" } else { "" }
        );
        match serde_json::to_string_pretty(&stats.payload) {
            Ok(payload) => println!("{}", payload),
            Err(e) => warn!("Payload not printable: {}", e),
        }
        return;
    }
    if let Some(summary) = &view.onboarding_summary {
        println!(
            "Found {}. Run again with --onboarded to load statistics.",
            summary.label()
        );
        return;
    }
    println!("No result");
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
