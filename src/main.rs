#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # edgegate
//!
//! Captive-portal gatekeeper for edge Wi-Fi devices.
//!
//! Clients joining the hotspot are redirected to a splash page until the
//! companion app posts their session token to `POST /auth`. The token is
//! checked against the central backend, a session is recorded, and the
//! client's address is let through the host firewall until the session
//! expires.
//!
//! ## Subcommands
//!
//! - `edgegate serve` (default): run the portal
//! - `edgegate supervise`: run as supervisor, restarting the portal on crash
//! - `edgegate teardown`: remove the portal's global firewall rules
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, startup and graceful shutdown
//! supervisor.rs    built-in supervisor (spawn/restart loop)
//! config.rs        TOML + env-var configuration
//! store.rs         SessionStore: token, device and address indices
//! access.rs        AccessController: authenticate, revoke
//! validator.rs     BackendValidator, HttpValidator (reqwest)
//! captive.rs       CaptivePortalDetector, probe kinds
//! sweeper.rs       ExpirySweeper
//! activity.rs      access journal + broadcast
//! enforcement/
//!   mod.rs         EnforcementBackend trait
//!   iptables.rs    iptables/ip6tables rules
//!   memory.rs      in-memory dry run
//!   command.rs     host command runner with timeout
//! routes/          HTTP handlers
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use edgegate::config::{Config, FirewallMode};
use edgegate::enforcement::{self, EnforcementBackend};
use edgegate::error::{EnforcementError, ValidatorError};
use edgegate::state::AppState;
use edgegate::util::Clock;
use edgegate::validator::HttpValidator;
use edgegate::{routes, supervisor};

/// Captive-portal gatekeeper for edge Wi-Fi devices.
#[derive(Parser)]
#[command(name = "edgegate", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Run the portal (default when no subcommand given).
    Serve,
    /// Run as supervisor: starts the portal and restarts it on crash.
    Supervise,
    /// Remove the portal's global firewall rules and exit.
    Teardown,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(std::io::Error),
    #[error(transparent)]
    Validator(#[from] ValidatorError),
    #[error("firewall setup failed: {0}")]
    Firewall(#[from] EnforcementError),
    #[error("supervisor failed: {0}")]
    Supervisor(std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("edgegate: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(config).await,
        Commands::Supervise => {
            info!("edgegate supervisor starting");
            supervisor::run_supervisor(cli.config.as_deref(), &config.supervisor)
                .await
                .map_err(StartupError::Supervisor)
        }
        Commands::Teardown => run_teardown(&config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> Result<(), StartupError> {
    info!("edgegate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Edge device: {}", config.backend.device_id);
    info!("Validator backend: {}", config.backend.url);
    info!("Portal: {}", config.portal.splash_url());

    if config.auth.api_key == "change-me" {
        warn!("Using default API key, set EDGEGATE_API_KEY or update config");
    }

    let validator = Arc::new(HttpValidator::new(&config.backend)?);
    let firewall = enforcement::from_config(&config.firewall, &config.portal);
    let manage_base_rules = config.firewall.manage_base_rules;
    info!("Firewall backend: {}", firewall.name());

    if manage_base_rules {
        if let Err(e) = firewall.install_base_rules().await {
            if let Err(cleanup) = firewall.remove_base_rules().await {
                warn!("Cleanup after failed setup also failed: {cleanup}");
            }
            return Err(e.into());
        }
    }

    let listen = config.server.listen.clone();
    let state = AppState::new(config, firewall.clone(), validator, Clock::system());

    let shutdown = state.shutdown.clone();
    let sweeper_task = state.sweeper().spawn(shutdown.clone());

    let listener = match TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(source) => {
            shutdown.cancel();
            shutdown_firewall(&state, firewall.as_ref(), manage_base_rules).await;
            return Err(StartupError::Bind { addr: listen, source });
        }
    };
    info!("Listening on {listen}");

    let app = routes::router(state.clone());
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_on_signal(shutdown.clone()))
    .await;

    info!("Shutting down...");
    shutdown.cancel();
    if let Err(e) = sweeper_task.await {
        warn!("Sweeper task ended abnormally: {e}");
    }
    shutdown_firewall(&state, firewall.as_ref(), manage_base_rules).await;
    info!("Goodbye");

    served.map_err(StartupError::Serve)
}

/// Revoke every live session and, if we own them, drop the base rules.
async fn shutdown_firewall(state: &AppState, firewall: &dyn EnforcementBackend, base: bool) {
    state.access.revoke_all("shutdown").await;
    if base {
        if let Err(e) = firewall.remove_base_rules().await {
            warn!("Failed to remove base rules: {e}");
        }
    }
}

async fn run_teardown(config: &Config) -> Result<(), StartupError> {
    if config.firewall.mode == FirewallMode::DryRun {
        info!("Dry-run mode, nothing to tear down");
        return Ok(());
    }
    let firewall = enforcement::from_config(&config.firewall, &config.portal);
    firewall.remove_base_rules().await?;
    info!("Base rules removed");
    Ok(())
}

/// Wait for a signal, then fire `shutdown` so open event streams close and
/// the graceful drain can finish.
async fn shutdown_on_signal(shutdown: CancellationToken) {
    tokio::select! {
        () = shutdown_signal() => {}
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!("Could not register SIGTERM handler: {e}");
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    }
}
