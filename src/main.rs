//! warden - supervisor for a long-running bot worker
//!
//! Runs the worker as a child process, restarts it when it crashes, and
//! exposes an HTTP control API with a live event stream.
//!
//! ## Usage
//!
//! ```bash
//! # Serve on the configured port (default 3002)
//! warden
//!
//! # Explicit config file, start the worker right away
//! warden --config /etc/warden/config.yaml --autostart
//!
//! # Validate configuration and exit
//! warden --check-config
//!
//! # With verbose logging
//! warden -v
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, anyhow, bail};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use warden_config::WardenConfig;
use warden_core::{WardenError, init_logging};
use warden_server::{AppState, router};
use warden_worker::Supervisor;

/// Process supervisor and control API for a bot worker
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.warden/config.yaml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging (increases log level)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.warden/logs/)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Address to bind, overrides the config file and HOST
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, overrides the config file and PORT
    #[arg(long)]
    port: Option<u16>,

    /// Start the worker as soon as the service is up
    #[arg(long)]
    autostart: bool,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_logging(cli.log_dir.clone(), cli.verbose > 0) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };

    match run(cli).await {
        Ok(()) => {
            info!("warden exited normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("warden error: {:#}", e);
            eprintln!("Error: {:#}", e);
            if let Some(guidance) = e.downcast_ref::<WardenError>().and_then(WardenError::guidance) {
                eprintln!("{guidance}");
            }
            ExitCode::from(1)
        }
    }
}

/// Resolve configuration with CLI flags taking precedence.
fn load_config(cli: &Cli) -> anyhow::Result<WardenConfig> {
    let mut config = WardenConfig::load(cli.config.as_deref())?;

    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.autostart {
        config.autostart = true;
    }

    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    if cli.check_config {
        println!(
            "Configuration OK: {} on {}",
            config.worker.command_line().join(" "),
            config.server.bind_addr()
        );
        return Ok(());
    }

    let supervisor = Supervisor::new(config.supervisor_config());
    let shutdown = CancellationToken::new();
    let shutdown_timeout = config.supervisor.shutdown_timeout;
    let autostart = config.autostart;

    let addr = config.server.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| WardenError::ServerBind {
            addr: addr.clone(),
            source,
        })?;

    info!(
        %addr,
        command = %config.worker.command_line().join(" "),
        auto_restart = config.restart.auto_restart,
        "warden listening"
    );

    let app = router(AppState::new(supervisor.clone(), config).with_shutdown(shutdown.clone()));
    let mut server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }
    });

    if autostart {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            match supervisor.start().await {
                Ok(state) => info!(pid = ?state.process_id, "Worker autostarted"),
                Err(e) => warn!(error = %e, "Autostart failed"),
            }
        });
    }

    tokio::select! {
        signal = wait_for_signal() => {
            info!(signal = signal?, "Shutting down");
        }
        result = &mut server => {
            // The server never stops on its own unless it failed
            shutdown.cancel();
            supervisor.shutdown().await?;
            return match result {
                Ok(Ok(())) => Err(anyhow!("HTTP server stopped unexpectedly")),
                Ok(Err(e)) => Err(e).context("HTTP server failed"),
                Err(e) => Err(e).context("HTTP server task panicked"),
            };
        }
    }

    // Stops accepting requests and closes event streams
    shutdown.cancel();

    let drained = tokio::time::timeout(shutdown_timeout, async {
        if let Err(e) = supervisor.shutdown().await {
            warn!(error = %e, "Worker did not stop cleanly");
        }
        match server.await {
            Ok(result) => result.context("HTTP server failed"),
            Err(e) => Err(e).context("HTTP server task panicked"),
        }
    })
    .await;

    match drained {
        Ok(result) => result,
        Err(_) => bail!("shutdown did not finish within {:?}", shutdown_timeout),
    }
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() -> anyhow::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c")?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        Ok("ctrl-c")
    }
}
