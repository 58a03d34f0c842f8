//! `comfyrun-worker` -- serverless ComfyUI job worker.
//!
//! Submits a workflow to a local ComfyUI instance, waits for it to
//! finish and returns its outputs as one consolidated result.
//!
//! # Subcommands
//!
//! | Command    | Description                                              |
//! |------------|----------------------------------------------------------|
//! | `run`      | One invocation from `--test-input`, `--input-file` or `test_input.json` |
//! | `serve`    | Local HTTP API: `POST /run`, `POST /runsync`, `GET /health` |
//! | `diagnose` | Print the network volume report                          |
//!
//! Configuration is read from the environment (and `.env`); see
//! [`comfyrun_worker::config::WorkerConfig::from_env`].

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use comfyrun_worker::config::{LogFormat, WorkerConfig};
use comfyrun_worker::diagnostics;
use comfyrun_worker::payload::{load_payload, DEFAULT_INPUT_FILE};
use comfyrun_worker::router::build_app_router;
use comfyrun_worker::state::AppState;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "comfyrun-worker", version, about = "Serverless ComfyUI job worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single invocation and print the result as JSON
    Run {
        /// Request payload as inline JSON
        #[arg(long, conflicts_with = "input_file")]
        test_input: Option<String>,

        /// Read the request payload from this file
        #[arg(long)]
        input_file: Option<PathBuf>,
    },

    /// Serve the local HTTP API
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(long, default_value_t = 8000)]
        port: u16,
    },

    /// Inspect the network volume and print what ComfyUI will see
    Diagnose,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_tracing(LogFormat::from_env_or_default());

    let config = WorkerConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });
    tracing::info!(
        comfy_url = %config.comfy_url(),
        delivery = ?config.bridge.delivery,
        job_timeout_secs = config.bridge.job_timeout.as_secs(),
        "Loaded worker configuration",
    );

    match cli.command {
        Command::Run {
            test_input,
            input_file,
        } => run_once(&config, test_input.as_deref(), input_file.as_deref()).await,
        Command::Serve { host, port } => serve(&config, &host, port).await,
        Command::Diagnose => {
            let report = diagnostics::scan(&config)
                .await
                .context("Volume diagnostics failed")?;
            print!("{}", report.render());
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "comfyrun_worker=info,comfyrun_comfyui=info,tower_http=info".into());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn run_once(
    config: &WorkerConfig,
    test_input: Option<&str>,
    input_file: Option<&Path>,
) -> anyhow::Result<()> {
    let payload = load_payload(test_input, input_file, Path::new(DEFAULT_INPUT_FILE))?;

    if config.volume_debug {
        diagnostics::log_volume_report(config).await;
    }

    let bridge = config.build_bridge()?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received SIGINT (Ctrl-C), cancelling invocation");
            on_ctrl_c.cancel();
        }
    });

    let result = bridge.run(payload, &cancel).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn serve(config: &WorkerConfig, host: &str, port: u16) -> anyhow::Result<()> {
    if config.volume_debug {
        diagnostics::log_volume_report(config).await;
    }

    let state = AppState::new(config.build_bridge()?);
    let app = build_app_router(state, config.request_timeout());

    let ip: IpAddr = host
        .parse()
        .with_context(|| format!("Invalid --host address '{host}'"))?;
    let addr = SocketAddr::new(ip, port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
