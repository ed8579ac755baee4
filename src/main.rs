use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::audit::{JsonLinesSink, RecentRejections, SinkSet, TracingSink};
use gatekeeper::config::GatekeeperConfig;
use gatekeeper::http::{spawn_sweeper, AdmissionServer, AppState};
use gatekeeper::ratelimit::{AdmissionControlService, InMemoryRiskScores};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Tiered request admission control with risk-driven escalation.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init(),
    }

    let mut config = GatekeeperConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    if args.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    info!("Starting Gatekeeper admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        tiers = config.tiers.len(),
        escalation = config.escalation.enabled,
        "Configuration loaded"
    );

    let recent = Arc::new(RecentRejections::new(config.audit.recent_capacity));
    let mut sinks = SinkSet::new().with(recent.clone());
    if config.audit.log_rejections {
        sinks = sinks.with(Arc::new(TracingSink));
    }
    let audit_writer = match &config.audit.jsonl_path {
        Some(path) => {
            let (sink, writer) = JsonLinesSink::spawn(path, config.audit.jsonl_buffer).await?;
            info!(path = %path.display(), "Writing rejection audit log");
            sinks = sinks.with(Arc::new(sink));
            Some(writer)
        }
        None => None,
    };

    let scores = Arc::new(InMemoryRiskScores::new());
    let service = Arc::new(AdmissionControlService::from_config(&config, scores.clone(), sinks)?);
    info!("Admission control initialized");

    let sweeper = spawn_sweeper(
        Arc::clone(&service),
        Duration::from_secs(config.server.sweep_interval_secs.max(1)),
    );

    let state = AppState {
        service,
        scores,
        recent,
    };
    AdmissionServer::new(config.server.listen_addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    // Dropping the last service handle closes the audit channel, letting the
    // writer drain what is buffered.
    sweeper.abort();
    let _ = sweeper.await;
    if let Some(writer) = audit_writer {
        if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
            warn!("Audit log writer did not drain before shutdown");
        }
    }

    info!("Gatekeeper stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
