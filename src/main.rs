use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lognog_agent::agent::AgentError;
use lognog_agent::{Agent, Config};

#[derive(Debug, Parser)]
#[command(
    name = "lognog-agent",
    version,
    about = "Ships log lines and file integrity events to a LogNog server"
)]
struct Cli {
    /// Path to the configuration file (defaults to the per-user config
    /// directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging regardless of configuration.
    #[arg(long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("failed to load configuration: {error}");
            process::exit(exitcode::CONFIG);
        }
    };

    init_logging(cli.debug || config.debug_logging);

    let agent = match Agent::new(config) {
        Ok(agent) => agent,
        Err(error) => {
            error!(message = "Failed to initialize agent.", %error);
            process::exit(exitcode::SOFTWARE);
        }
    };

    match agent.start() {
        Ok(()) => {}
        Err(AgentError::AlreadyRunning) => {
            error!(
                message =
                    "Another agent instance is already running; stop it before starting a new one."
            );
            process::exit(exitcode::TEMPFAIL);
        }
        Err(error) => {
            error!(message = "Failed to start agent.", %error);
            process::exit(exitcode::SOFTWARE);
        }
    }

    wait_for_shutdown();
    agent.stop();
    process::exit(exitcode::OK);
}

fn init_logging(debug: bool) {
    let default_directives = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Block until SIGINT or SIGTERM (Ctrl-C elsewhere).
fn wait_for_shutdown() {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(message = "Failed to build signal runtime.", %error);
            return;
        }
    };

    runtime.block_on(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!(message = "Received interrupt."),
                        _ = terminate.recv() => info!(message = "Received terminate signal."),
                    }
                }
                Err(error) => {
                    error!(message = "Failed to install SIGTERM handler.", %error);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(message = "Received interrupt.");
            }
        }
    });
}
