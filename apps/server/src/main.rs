use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parlor_server::bus::memory::MemoryBusNetwork;
use parlor_server::bus::Bus;
use parlor_server::config::Config;
use parlor_server::hub::Hub;
use parlor_server::repository::{MemoryRepository, Repository};
use parlor_server::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    let port = config.port;

    // In-memory repository for single-node deployments. A relational
    // implementation plugs in behind the Repository trait.
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());

    // In-process bus endpoint. A broker-backed client plugs in behind the
    // Bus trait; the bridge and its dedup rules are identical either way.
    let bus: Option<Arc<dyn Bus>> = if config.bus_enabled {
        let network = MemoryBusNetwork::new();
        Some(Arc::new(network.endpoint(config.server_id.clone())))
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    let hub = Hub::new(&config, Some(repo), bus, shutdown.clone());

    tracing::info!(
        server_id = %config.server_id,
        bus_enabled = config.bus_enabled,
        "parlor server configured"
    );

    tokio::spawn(hub.clone().run());

    // Ctrl-C cancels the hub and drains the listener.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let state = AppState {
        hub,
        config: config.clone(),
    };

    let app = parlor_server::gateway::server::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "parlor server listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .expect("server error");
}
