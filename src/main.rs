//! Deskbox - session lifecycle and event fan-out backend for disposable
//! cloud desktops.
//!
//! Usage:
//!   deskbox serve [--port 8080]

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use deskbox::config::{
    Config, DEFAULT_PENDING_CAPACITY, DEFAULT_SESSION_TIMEOUT_SECS, DEFAULT_STOP_GRACE_SECS,
    DEFAULT_SWEEP_INTERVAL_SECS,
};
use deskbox::demo::{DemoEngine, DemoProvider};
use deskbox::{http_server, AppState};

#[derive(Parser, Debug)]
#[command(name = "deskbox")]
#[command(about = "Session backend for disposable cloud desktops")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "DESKBOX_PORT", default_value = "8080")]
        port: u16,

        /// Session idle timeout in seconds
        #[arg(long, env = "DESKBOX_SESSION_TIMEOUT", default_value_t = DEFAULT_SESSION_TIMEOUT_SECS)]
        session_timeout: u64,

        /// Expiry sweep interval in seconds
        #[arg(long, env = "DESKBOX_SWEEP_INTERVAL", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
        sweep_interval: u64,

        /// Queued events kept per session while disconnected
        #[arg(long, env = "DESKBOX_PENDING_CAPACITY", default_value_t = DEFAULT_PENDING_CAPACITY)]
        pending_capacity: usize,

        /// Seconds to wait for a stopped task to settle
        #[arg(long, env = "DESKBOX_STOP_GRACE", default_value_t = DEFAULT_STOP_GRACE_SECS)]
        stop_grace: u64,

        /// Sandbox template name passed to the provider
        #[arg(long, env = "DESKBOX_TEMPLATE")]
        template: Option<String>,

        /// Provider-side sandbox auto-kill timeout in seconds
        #[arg(long, env = "DESKBOX_SANDBOX_TIMEOUT", default_value = "1200")]
        sandbox_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            port,
            session_timeout,
            sweep_interval,
            pending_capacity,
            stop_grace,
            template,
            sandbox_timeout,
        } => {
            let config = Config {
                port,
                session_timeout: Duration::from_secs(session_timeout),
                sweep_interval: Duration::from_secs(sweep_interval),
                pending_capacity,
                stop_grace: Duration::from_secs(stop_grace),
                template,
                sandbox_timeout_secs: sandbox_timeout,
            };

            let state = AppState::new(
                config,
                Arc::new(DemoProvider::new()),
                Arc::new(DemoEngine::default()),
            );

            // Drain sessions and their sandboxes before exiting on ctrl-c.
            tokio::select! {
                result = http_server::run_server(state.clone()) => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received, tearing down sessions");
                    state.shutdown().await;
                }
            }
        }
    }
    Ok(())
}
