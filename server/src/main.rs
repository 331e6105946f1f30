use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use pickem_hub::auth::jwt;
use pickem_hub::config::{generate_config_template, Config, StoreBackend};
use pickem_hub::routes;
use pickem_hub::shutdown;
use pickem_hub::state::{AppState, HubSettings};
use pickem_hub::store::memory::MemoryStore;
use pickem_hub::store::sqlite::SqliteStore;
use pickem_hub::store::SharedStore;
use pickem_hub::ws::heartbeat;
use pickem_hub::ws::hub::Hub;

/// How long connection actors get to flush the shutdown announcement.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    config.validate()?;

    // Initialize tracing/logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pickem_hub=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("Pick'em hub v{} starting", env!("CARGO_PKG_VERSION"));

    let store: SharedStore = match config.store {
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.data_dir)?),
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store with demo data; picks are lost on restart");
            Arc::new(MemoryStore::with_demo_data())
        }
    };

    let settings = HubSettings::from_config(&config);
    let mut app_state = AppState::new(store, settings);
    match &config.jwt_secret_file {
        Some(path) => {
            app_state = app_state.with_jwt_secret(jwt::load_jwt_secret(Path::new(path))?);
        }
        None => tracing::info!("No jwt_secret_file configured, token credentials disabled"),
    }

    // Evict connections that stop sending frames
    heartbeat::spawn(
        app_state.hub.clone(),
        settings.heartbeat_interval,
        settings.heartbeat_timeout,
    );

    let hub = app_state.hub.clone();
    let tasks = app_state.tasks.clone();
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    // Upgraded sockets are not covered by axum's graceful shutdown
    shutdown::drain(&tasks, SHUTDOWN_GRACE).await;

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM, after telling every client the hub is going
/// away and closing their sockets.
async fn shutdown_signal(hub: Arc<Hub>) {
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!(
        connections = hub.connection_count(),
        "Shutdown signal received, closing connections"
    );
    shutdown::announce_and_close(&hub);
}
