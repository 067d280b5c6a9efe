use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetsync::api;
use fleetsync::cli;
use fleetsync::engine::Engine;
use fleetsync::node_client::HttpNodeClient;
use fleetsync::store::{MemoryStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args and env vars
    let settings = cli::Cli::parse().into_settings();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "fleetsync=debug,tower_http=debug".into());
    if settings.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    settings.engine.validate()?;

    // Socket server listen address setup
    let listen_address: IpAddr = settings
        .listen_address
        .parse::<IpAddr>()
        .with_context(|| format!("Invalid ip address {}", settings.listen_address))?;
    let socket_address = SocketAddr::from((listen_address, settings.listen_port));

    let store: Arc<dyn Store> = match &settings.state_file {
        Some(path) => Arc::new(
            MemoryStore::open(path)
                .await
                .with_context(|| format!("Cannot open state file {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    let client = Arc::new(HttpNodeClient::from_settings(&settings.engine));
    let engine = Engine::start(settings.engine.clone(), store, client)
        .await
        .context("Engine failed to start")?;

    // Build Axum Router
    let api = api::api(engine.clone()).await?;

    // Start server
    info!("Starting fleetsync on {}", socket_address);
    axum::Server::bind(&socket_address)
        .serve(api.into_make_service())
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received ctrl-c, shutting down");
            }
        })
        .await?;

    engine.shutdown().await?;
    Ok(())
}
