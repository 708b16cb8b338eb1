use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use stbrelay::config::{Settings, StreamMethod};
use stbrelay::portal::StalkerClient;
use stbrelay::store::PortalStore;
use stbrelay::{create_app, discover_portal_endpoints, AppState};
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Stream delivery method (overrides config)
    #[arg(long)]
    method: Option<StreamMethod>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut settings = Settings::load(&args.config)?;
    if let Some(method) = args.method {
        settings.streaming.method = method;
    }
    info!("Configuration loaded from {}: {:?}", args.config, settings);

    let store = Arc::new(PortalStore::load(&settings.store.path).await?);
    info!(
        "Loaded {} portal(s) from {}",
        store.portals().await.len(),
        settings.store.path.display()
    );

    let client = Arc::new(StalkerClient::new(settings.streaming.ffprobe_path.clone()));
    discover_portal_endpoints(&store, &client).await;
    let state = Arc::new(AppState::new(&settings, store, client)?);

    let sweeper = state
        .hls
        .spawn_sweeper(Duration::from_secs(settings.hls.sweep_interval.max(1)));
    let hls = state.hls.clone();

    let app = create_app(state);
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Listening on http://{} (method={:?})", addr, settings.streaming.method);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    sweeper.abort();
    hls.shutdown().await;
    Ok(())
}
