use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cubby_agent::{router, AppState};

#[derive(Parser, Debug)]
#[command(name = "cubby-agent")]
#[command(about = "In-container workspace agent: terminal sessions and sandboxed files")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "AGENT_PORT", default_value = "3001")]
    port: u16,

    /// Address to bind to
    #[arg(short, long, env = "AGENT_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Workspace root all sessions and file operations are scoped to
    #[arg(short, long, env = "WORKSPACE_DIR", default_value = "/workspace")]
    root: PathBuf,

    /// Workspace id this agent serves (informational, set by the lifecycle manager)
    #[arg(long, env = "WORKSPACE_ID")]
    workspace_id: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, env = "AGENT_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "cubby_agent=debug,tower_http=debug"
    } else {
        "cubby_agent=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // The volume mount provides the root in production; create it when
    // running outside a container.
    tokio::fs::create_dir_all(&cli.root).await?;
    let root = cli.root.canonicalize().unwrap_or(cli.root);

    if let Some(id) = &cli.workspace_id {
        info!(workspace_id = %id, "serving workspace");
    }
    info!(root = %root.display(), "sandbox root");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(AppState::new(root))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port).parse()?;
    info!(%addr, "starting cubby-agent");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
