//! `aild` binary: run an agent in an ephemeral container and optionally
//! apply what it changed to the current directory.

use std::{process::ExitCode, sync::Arc};

use aild_core::{BuildSession, Config};
use aild_engine::DockerEngine;
use aild_pty::LocalConsole;
use aild_session::{SessionOutcome, run_session};
use anyhow::anyhow;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
const LOG_ENV: &str = "AILD_LOG";

/// Run an agent against a disposable copy of the current directory.
#[derive(Debug, Parser)]
#[command(name = "aild", version, about)]
struct Cli {
    /// Agent to run inside the container.
    agent: String,
}

fn init_tracing() {
    // stderr only: stdout belongs to the relayed terminal
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Cancel `cancel` on the first SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let interrupt = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(%err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{SignalKind, signal};

            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    tracing::warn!(%err, "failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = interrupt => tracing::debug!("interrupt received"),
            () = terminate => tracing::debug!("terminate received"),
        }
        cancel.cancel();
    });
}

async fn run(cli: Cli) -> anyhow::Result<SessionOutcome> {
    let working_dir = std::env::current_dir()
        .map_err(|err| anyhow!("failed to determine the current directory: {err}"))?;
    let session = BuildSession::new(working_dir, cli.agent, Config::from_env());
    spawn_signal_handler(session.cancel.clone());

    tracing::debug!(
        engine = %session.config.engine_host,
        image = %session.config.image,
        agent = %session.agent,
        "starting session"
    );
    let outcome = run_session::<DockerEngine>(&session, Arc::new(LocalConsole::current())).await?;
    Ok(outcome)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(SessionOutcome::Applied(report)) => {
            tracing::debug!(applied = report.applied, skipped = report.skipped, "changes applied");
            println!("Changes applied successfully.");
            ExitCode::SUCCESS
        }
        Ok(SessionOutcome::Discarded) => {
            println!("Changes discarded.");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            // A prompt left blocked on stdin must not hold the process open.
            std::process::exit(1);
        }
    }
}
