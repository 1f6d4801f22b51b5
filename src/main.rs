use clap::Parser;
use subtitle_proxy::app::AppState;
use subtitle_proxy::config::load_config;
use subtitle_proxy::dispatcher;
use subtitle_proxy::lifecycle;
use tracing_subscriber::EnvFilter;

/// Bilingual YouTube subtitle proxy: fetches upstream timed-text, translates
/// it through an LLM, and caches the bilingual result.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the JSON config file. Defaults to ./proxy.json, then the
    /// platform config directory.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Override the configured HTTP port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the configured SQLite database path.
    #[arg(long)]
    db: Option<String>,

    /// Override RUST_LOG for this run only.
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = cli
        .log_filter
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| {
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,subtitle_proxy=info"))
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = load_config(cli.config.as_deref());
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let bind_addr = format!("{}:{}", config.server.bind_addr, config.server.port);

    let (state, worker_handle) = AppState::new(config).await?;
    let cleanup_handle = lifecycle::spawn_cleanup_ticker(state.clone());

    let app = dispatcher::router(state).layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind_addr, "subtitle proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(lifecycle::shutdown_signal())
        .await?;

    worker_handle.abort();
    cleanup_handle.abort();

    Ok(())
}
