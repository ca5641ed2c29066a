mod cli;
mod cloud;
mod config;
mod engine;
mod error;
mod listener;
mod signal;
mod ssh;
mod tunnel;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, ConnectTarget};
use error::EngineError;
use signal::SignalController;

#[tokio::main]
async fn main() -> ExitCode {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls CryptoProvider");

    // Load the dotenv file pointed at by --env-file / C8YLP_ENV_FILE before
    // clap parses, so its values are visible to clap's own `env = "..."`
    // lookups (lowest-precedence source in the CLI > env > file chain).
    let env_file = std::env::var("C8YLP_ENV_FILE").unwrap_or_else(|_| ".env".to_string());
    if let Err(e) = config::load_env_file(&env_file) {
        eprintln!("warning: {e}");
    }

    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli.logging, cli.net.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            e.exit_code()
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, EngineError> {
    let creds = config::resolve(&cli.net)?;
    let shutdown = SignalController::new();
    let token = shutdown.token();

    match cli.command {
        Command::Server { device } => {
            // Spawned, not awaited inline: dropping a select branch only
            // stops polling it, but a spawned task keeps running so the
            // engine gets to see the cancellation and drain gracefully
            // instead of being cut off mid-transition.
            let mut handle = tokio::spawn(engine::run(creds, device, token));
            let joined = tokio::select! {
                result = &mut handle => Some(result),
                _ = shutdown.wait_for_signal() => None,
            };
            let joined = match joined {
                Some(result) => result,
                None => handle.await,
            };
            let outcome = joined.map_err(|e| EngineError::Invocation(e.to_string()))??;
            Ok(outcome_exit_code(outcome))
        }
        Command::Connect { target } => match target {
            ConnectTarget::Ssh { device, ssh_args } => {
                let port = creds.port;
                let engine_task = tokio::spawn(engine::run(creds, device, token.clone()));

                // Give the listener a moment to bind before spawning ssh.
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                let ssh_result =
                    tokio::task::spawn_blocking(move || ssh::spawn_and_wait(port, &ssh_args))
                        .await
                        .map_err(|e| EngineError::Invocation(e.to_string()))?;

                token.cancel();
                let outcome = engine_task
                    .await
                    .map_err(|e| EngineError::Invocation(e.to_string()))??;

                match ssh_result {
                    Ok(status) if status.success() => Ok(outcome_exit_code(outcome)),
                    Ok(_) => Ok(ExitCode::from(1)),
                    Err(e) => Err(EngineError::Invocation(format!("failed to spawn ssh: {e}"))),
                }
            }
        },
    }
}

fn outcome_exit_code(outcome: engine::EngineOutcome) -> ExitCode {
    match outcome {
        engine::EngineOutcome::ShutdownClean => ExitCode::SUCCESS,
        engine::EngineOutcome::TunnelClosedWhileAttached => {
            ExitCode::from(error::EXIT_TUNNEL_CLOSED_WHILE_ATTACHED)
        }
    }
}

/// An `EnvFilter` over either a plain or JSON `fmt` layer, gated by
/// `-v`/`-vv` and `--log-json`. Returns the non-blocking file writer's
/// guard, which must stay alive for the process lifetime.
fn init_tracing(
    logging: &cli::LoggingArgs,
    verbose: u8,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match &logging.log_file {
        Some(path) => {
            let parent = std::path::Path::new(path)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "c8ylp.log".to_string());
            let appender = tracing_appender::rolling::daily(parent, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (Some(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = tracing_subscriber::fmt::layer();

    if logging.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer.json())
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    }

    guard
}
