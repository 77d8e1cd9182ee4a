//! vigild - privileged helper supervisor daemon
//!
//! Launches and supervises the vigil-agent helper, bridges suspend and
//! resume, and serves the authenticated control socket.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigild::{
    config::VigildConfig,
    console::{ConsoleLock, VtConsole},
    control::{server, ControlSurface},
    launcher::{HelperLauncher, Launcher},
    power::{PowerEventBridge, SignalPowerSource, SystemPowerController},
    registry::IdentityRegistry,
    supervisor::Supervisor,
};

#[derive(Parser)]
#[command(name = "vigild")]
#[command(version)]
#[command(about = "Privileged helper supervisor with an authenticated control socket")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VIGILD_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor daemon
    Run,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },

    /// Run deployment diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("vigild={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        let content = std::fs::read_to_string(config_path)?;
        toml::from_str(&content)?
    } else {
        VigildConfig::default()
    };

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?
        }
        Commands::Doctor => run_doctor(&config),
    }

    Ok(())
}

async fn run(config: VigildConfig) -> Result<()> {
    tracing::info!("starting vigild");

    let registry = Arc::new(IdentityRegistry::new());
    let launcher = HelperLauncher::new(config.helper.path.clone());
    let supervisor = Arc::new(Supervisor::with_cooldown(
        launcher,
        Arc::clone(&registry),
        Duration::from_secs(config.helper.cooldown_secs),
    ));
    let console = Arc::new(ConsoleLock::new(
        VtConsole::new(config.console.tty_path.clone()),
        config.console.locked_vt,
    ));
    let surface = Arc::new(ControlSurface::new(
        Arc::clone(&registry),
        console,
        Arc::new(SystemPowerController),
    ));

    // A failed first launch is fatal to startup
    supervisor.start().await?;

    // The suspend/resume bridge registers only after the first
    // successful start
    let bridge = PowerEventBridge::new(Arc::clone(&supervisor));
    let power_source = SignalPowerSource::new()?;
    let bridge_task = tokio::spawn(bridge.run(power_source));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let socket_path = config.control.socket_path.clone();
    let server_surface = Arc::clone(&surface);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server::serve(&socket_path, server_surface, shutdown_rx).await {
            tracing::error!(error = %e, "control server failed");
        }
    });

    tracing::info!("vigild is running, send SIGINT or SIGTERM to stop");
    wait_for_shutdown().await?;

    tracing::info!("shutting down");
    // Tear down the bridge first so a late resume event cannot restart
    // the supervisor mid-shutdown
    bridge_task.abort();
    let _ = shutdown_tx.send(true);
    let _ = server_task.await;
    if let Err(e) = supervisor.stop().await {
        tracing::warn!(error = %e, "supervisor stop failed during shutdown");
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = term.recv() => {}
    }
    Ok(())
}

fn show_config(config: Option<&VigildConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}

fn run_doctor(config: &VigildConfig) {
    println!("vigild doctor");
    println!();

    println!("Checking helper executable...");
    let launcher = HelperLauncher::new(config.helper.path.clone());
    match launcher.validate() {
        Ok(()) => println!("  ✓ {} passed validation", config.helper.path.display()),
        Err(e) => println!("  ✗ {}: {}", config.helper.path.display(), e),
    }

    println!();
    println!("Checking console device...");
    if config.console.tty_path.exists() {
        println!("  ✓ {} present", config.console.tty_path.display());
    } else {
        println!("  ✗ {} not found", config.console.tty_path.display());
    }

    println!();
    println!("Checking control socket directory...");
    match config.control.socket_path.parent() {
        Some(parent) if parent.is_dir() => println!("  ✓ {} present", parent.display()),
        Some(parent) => println!("  ✗ {} not found (created at startup)", parent.display()),
        None => println!("  ✗ socket path has no parent directory"),
    }

    println!();
    println!("Doctor check complete!");
}
