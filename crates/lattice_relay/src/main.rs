use axum::{Router, routing::get};
use lattice_core::replica::{ReplicaStore, SqliteStore};
use lattice_relay::{
    auth::TokenStore,
    config::Config,
    room::RoomRegistry,
    ws::{AppState, channel_handler},
};
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lattice_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Lattice Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {:?}", config.data_dir);

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!("Failed to create data directory: {}", e);
        std::process::exit(1);
    }

    // Document store shared by all rooms.
    let store: Arc<dyn ReplicaStore> =
        match SqliteStore::open(config.data_dir.join("documents.db")) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!("Failed to open document store: {}", e);
                std::process::exit(1);
            }
        };

    let tokens = match TokenStore::open(config.data_dir.join("auth.db")) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!("Failed to open token store: {}", e);
            std::process::exit(1);
        }
    };

    let rooms = Arc::new(RoomRegistry::new(store, config.persist_debounce));
    let state = AppState { tokens, rooms };

    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any); // In production, use specific origins from config

    let app = Router::new()
        .route("/", get(|| async { "Lattice Relay" }))
        .route("/health", get(|| async { "OK" }))
        .route("/pages/{page_id}/channel", get(channel_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Relay listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    info!("Relay shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
