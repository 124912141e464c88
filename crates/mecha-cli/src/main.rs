//! Mechafoord CLI
//!
//! Starts the Discord media bot

mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use mecha_config::Config;
use mecha_discord::DiscordBot;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mechafoord")]
#[command(about = "Discord bot that converts videos to GIFs and filters images", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log directory
    #[arg(long)]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: failed to read .env: {}", e);
        }
    }

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.core.log_level = level;
    }
    if let Some(dir) = cli.log_dir {
        config.core.log_dir = dir;
    }

    let log_dir = PathBuf::from(&config.core.log_dir);
    let _logging_guard = logging::init_logging(&log_dir, &config.core.log_level)?;
    install_panic_hook();
    print_banner(&config);

    let config = Arc::new(config);
    let mut bot = DiscordBot::new(config).await?;

    let shard_manager = bot.shard_manager();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, closing shards");
        shard_manager.shutdown_all().await;
    });

    bot.start().await?;
    info!("Mechafoord stopped");
    Ok(())
}

/// An explicit path must load; otherwise the default path is used when it
/// exists, else configuration comes from the environment alone.
fn load_config(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return Config::load(path).with_context(|| format!("failed to load {}", path.display()));
    }
    match Config::default_path() {
        Some(default_path) if default_path.is_file() => Config::load(&default_path)
            .with_context(|| format!("failed to load {}", default_path.display())),
        _ => Config::from_env().context("failed to read configuration from the environment"),
    }
}

fn print_banner(config: &Config) {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    info!(
        "Mechafoord v{} ({} {}, {} CPUs) in {} mode",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
        cpus,
        config
            .core
            .environment
            .map_or_else(|| "unset".to_string(), |mode| mode.to_string())
    );
}

/// Any panic is fatal: log it and leave restarting to the supervisor.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        error!(location = %location, payload = %payload, "Panic, exiting");
        eprintln!("panic at {}: {}", location, payload);
        std::process::exit(1);
    }));
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm => {}
    }
}
