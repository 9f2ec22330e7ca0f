use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use tower_http::cors::{Any, CorsLayer};

use cubby::auth::AuthVerifier;
use cubby::broker::LocalBroker;
use cubby::container::{ContainerRuntime, ContainerRuntimeApi};
use cubby::gateway::{self, GatewayState};
use cubby::lifecycle::{LifecycleConfig, LifecycleManager};
use cubby::settings::Settings;

#[derive(Debug, Parser)]
#[command(name = "cubby")]
#[command(about = "Workspace session server: container lifecycle and session proxy gateway")]
#[command(version)]
struct Cli {
    /// Config file path (TOML)
    #[arg(short, long, env = "CUBBY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level)
        .init();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        settings.bind = bind;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }

    if settings.auth.required && settings.auth.jwt_secret.is_none() {
        anyhow::bail!(
            "authentication is required but no JWT secret is configured \
             (set auth.jwt_secret or auth.required = false)"
        );
    }

    let runtime = Arc::new(ContainerRuntime::new());
    info!("using container runtime: {}", runtime.runtime_type());
    match runtime.version().await {
        Ok(version) => info!("container runtime version {version}"),
        Err(e) => warn!("container runtime health check failed: {e}"),
    }

    let lifecycle = Arc::new(LifecycleManager::new(
        runtime,
        LifecycleConfig::from(&settings.container),
    ));

    let state = GatewayState::new(
        lifecycle,
        Arc::new(LocalBroker::new()),
        AuthVerifier::new(settings.auth.clone()),
        Duration::from_secs(settings.join_timeout_secs),
    );
    gateway::spawn_broker_relay(state.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = gateway::router(state).layer(cors);
    let addr: SocketAddr = format!("{}:{}", settings.bind, settings.port)
        .parse()
        .context("parsing bind address")?;
    info!("starting cubby gateway on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("binding gateway listener")?;
    axum::serve(listener, app).await.context("serving gateway")?;

    Ok(())
}
