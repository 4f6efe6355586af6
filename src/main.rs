mod bootstrap;
mod config;
mod deploy;
mod fleet;
mod health;
mod http;
mod metrics;
mod repository;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::bootstrap::archive::HttpArchiveSource;
use crate::bootstrap::report::CallbackReporter;
use crate::bootstrap::Bootstrapper;
use crate::config::Config;
use crate::fleet::FleetRegistry;
use crate::fleet::aws::AwsFleet;
use crate::metrics::MetricsRegistry;
use crate::repository::codecommit::CodeCommitStore;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "firmware-ota", about = "IoT firmware OTA control plane")]
struct Cli {
    /// Path to the YAML configuration file.  Built-in defaults when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API.
    Serve,
    /// Create a firmware deployment job for one device.
    Deploy(deploy::DeployArgs),
    /// Run the repository bootstrap for one lifecycle event.
    Bootstrap {
        /// Event JSON file; read from stdin when omitted.
        #[arg(long)]
        event: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
pub struct AppState {
    pub config: Arc<Config>,
    /// `server.cors_allow_origin`, parsed once at startup.
    pub cors_allow_origin: HeaderValue,
    pub fleet: Arc<dyn FleetRegistry>,
    pub bootstrapper: Arc<Bootstrapper>,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// AWS clients
// ---------------------------------------------------------------------------

struct AwsClients {
    iot: aws_sdk_iot::Client,
    sts: aws_sdk_sts::Client,
    codecommit: aws_sdk_codecommit::Client,
}

async fn build_aws_clients(region: &str) -> AwsClients {
    let aws_config = aws_config::from_env()
        .region(aws_config::Region::new(region.to_string()))
        .load()
        .await;

    tracing::info!(%region, "AWS clients initialised");
    AwsClients {
        iot: aws_sdk_iot::Client::new(&aws_config),
        sts: aws_sdk_sts::Client::new(&aws_config),
        codecommit: aws_sdk_codecommit::Client::new(&aws_config),
    }
}

fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("firmware-ota/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

fn build_bootstrapper(
    config: &Config,
    clients: &AwsClients,
    http_client: reqwest::Client,
    metrics: MetricsRegistry,
) -> Bootstrapper {
    Bootstrapper::new(
        config.bootstrap.clone(),
        Arc::new(HttpArchiveSource::new(http_client.clone())),
        Arc::new(CodeCommitStore::new(clients.codecommit.clone())),
        Arc::new(CallbackReporter::new(http_client)),
        metrics,
    )
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn run_serve(config: Arc<Config>) -> Result<()> {
    let metrics = MetricsRegistry::new();
    let clients = build_aws_clients(&config.aws.region).await;
    let http_client = build_http_client()?;

    let cors_allow_origin = HeaderValue::from_str(&config.server.cors_allow_origin)
        .context("invalid server.cors_allow_origin")?;
    let bootstrapper = build_bootstrapper(&config, &clients, http_client, metrics.clone());
    let fleet = AwsFleet::new(clients.iot, clients.sts, metrics.clone());

    let state = Arc::new(AppState {
        config,
        cors_allow_origin,
        fleet: Arc::new(fleet),
        bootstrapper: Arc::new(bootstrapper),
        metrics,
    });

    run_http_server(state).await
}

async fn run_deploy_command(config: Arc<Config>, args: deploy::DeployArgs) -> Result<()> {
    let region = args
        .region
        .clone()
        .unwrap_or_else(|| config.aws.region.clone());
    let clients = build_aws_clients(&region).await;
    let fleet = AwsFleet::new(clients.iot, clients.sts, MetricsRegistry::new());

    let report = deploy::run_deploy(&fleet, &config.fleet, &region, args).await?;
    tracing::info!(
        job_id = %report.job.job_id,
        job_arn = ?report.job.job_arn,
        "deployment finished"
    );
    Ok(())
}

async fn run_bootstrap(config: Arc<Config>, event_path: Option<PathBuf>) -> Result<()> {
    let raw = match &event_path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read event file: {}", path.display()))?,
        None => tokio::task::spawn_blocking(|| {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).map(|_| buf)
        })
        .await
        .context("stdin reader task failed")?
        .context("failed to read event from stdin")?,
    };
    let value: serde_json::Value = serde_json::from_str(&raw).context("invalid lifecycle event")?;

    let clients = build_aws_clients(&config.aws.region).await;
    let bootstrapper =
        build_bootstrapper(&config, &clients, build_http_client()?, MetricsRegistry::new());

    let outcome = bootstrapper
        .handle_value(value)
        .await
        .context("invalid lifecycle event")?;
    println!("{}", serde_json::to_string(&outcome)?);
    anyhow::ensure!(
        outcome.is_success(),
        "bootstrap failed: {}",
        outcome.reason.as_deref().unwrap_or("unknown error")
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => {
            let config = Config::default();
            config::validate_config(&config)?;
            config
        }
    };
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = ?cli.config, "starting firmware-ota");

    match cli.command {
        Command::Serve => run_serve(config).await,
        Command::Deploy(args) => run_deploy_command(config, args).await,
        Command::Bootstrap { event } => run_bootstrap(config, event).await,
    }
}
