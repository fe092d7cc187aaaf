// ABOUTME: Main entry point for the fieldbot dispatch gateway
// ABOUTME: Initializes logging and config, then runs the gateway or one of the offline tools

use anyhow::{Context, Result};
use clap::Parser;
use fieldbot::cli::{self, Cli, Commands};
use fieldbot::gateway::{open_session_store, Gateway};
use fieldbot::platform::MatrixTransport;
use fieldbot::server;
use fieldbot_core::config::Config;
use fieldbot_core::metrics;
use fieldbot_core::paths;
use fieldbot_core::store::SqliteRepository;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let _guard = init_logging(true);
            install_panic_hook();
            run_gateway().await
        }
        Commands::Status { json } => {
            let _guard = init_logging(false);
            cli::print_status(json)
        }
        Commands::Enqueue { recipient, message } => {
            let _guard = init_logging(false);
            cli::enqueue(&recipient, &message).await
        }
        Commands::AddJob {
            job_number,
            customer,
            address,
            title,
        } => {
            let _guard = init_logging(false);
            cli::add_job(&job_number, &title, customer, address)
        }
        Commands::Approve { phone } => {
            let _guard = init_logging(false);
            cli::approve(&phone)
        }
    }
}

/// stderr always; a daily-rotated file under the data dir when running the gateway.
/// `LOG_FORMAT=json` switches both layers to JSON lines.
fn init_logging(with_file: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,matrix_sdk_crypto=warn,matrix_sdk::sync=warn".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let stderr_layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = if with_file {
        let log_dir = paths::log_dir();
        match std::fs::create_dir_all(&log_dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(&log_dir, "fieldbot.log");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = if json {
                    fmt::layer().json().with_writer(writer).boxed()
                } else {
                    fmt::layer().with_ansi(false).with_writer(writer).boxed()
                };
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!(
                    "Warning: could not create log dir {}: {}",
                    log_dir.display(),
                    e
                );
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(payload = %payload, location = %location, "PANIC");
        eprintln!("PANIC at {}: {}", location, payload);
    }));
}

async fn run_gateway() -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting fieldbot");

    let config = Config::load()?;
    tracing::info!(
        homeserver = %config.matrix.home_server,
        user_id = %config.matrix.user_id,
        database = %config.database.path,
        http = %format!("{}:{}", config.server.host, config.server.port),
        "Configuration loaded"
    );

    let metrics_handle = match metrics::init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics exporter unavailable");
            None
        }
    };

    let repo = SqliteRepository::open(&config.database.path)
        .with_context(|| format!("Failed to open database at {}", config.database.path))?;
    let sessions = open_session_store(&config)?;
    let transport = Arc::new(
        MatrixTransport::new(
            config.matrix.clone(),
            config.commands.default_country_code.clone(),
        )
        .with_store_passphrase(config.credentials.passphrase.clone()),
    );

    let gateway = Gateway::start(&config, transport, repo, sessions);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = gateway.app_state(config.server.api_key.clone(), metrics_handle);
    let server_cancel = gateway.cancel_token();
    let server_task =
        tokio::spawn(async move { server::start_server(&addr, state, server_cancel).await });

    shutdown_signal().await;
    gateway.shutdown().await;

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server exited with error"),
        Err(e) => tracing::error!(error = %e, "HTTP server task panicked"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
