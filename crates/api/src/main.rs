use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tandem_api::config::ServerConfig;
use tandem_api::router::build_app_router;
use tandem_api::state::AppState;
use tandem_api::ws::{start_heartbeat, WsManager};
use tandem_core::clock::SystemClock;
use tandem_db::{PgStore, ProcedureConfig, StoreProcedures};
use tandem_events::ChannelHub;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_api=debug,tandem_db=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(
        host = %config.host,
        port = %config.port,
        partner_timeout_secs = config.partner_timeout_secs,
        "Loaded server configuration"
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = tandem_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    tandem_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    tracing::info!("Database health check passed");

    tandem_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Procedures and push channels ---
    let channels = Arc::new(ChannelHub::default());
    let procedures = StoreProcedures::new(
        Arc::new(PgStore::new(pool)),
        channels.clone(),
        Arc::new(SystemClock),
    )
    .with_config(ProcedureConfig {
        partner_timeout: config.partner_timeout(),
    });

    // --- Push connections ---
    let ws_manager = Arc::new(WsManager::new());

    let state = AppState {
        procedures: Arc::new(procedures),
        channels: channels.clone(),
        config: Arc::new(config.clone()),
        ws_manager: ws_manager.clone(),
    };
    let app = build_app_router(state, &config);

    let cancel = CancellationToken::new();
    let prune_handle = tokio::spawn(prune_channels(channels.clone(), cancel.clone()));
    let heartbeat_handle = start_heartbeat(ws_manager.clone(), cancel.clone());

    // --- Serve ---
    let addr = SocketAddr::new(config.host.parse().expect("Invalid HOST"), config.port);
    tracing::info!("Starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(ws_manager))
        .await
        .expect("Server error");

    cancel.cancel();
    let _ = prune_handle.await;
    let _ = heartbeat_handle.await;
    channels.shutdown();
    tracing::info!("Server stopped");
}

/// Periodically drop push topics nobody listens to anymore.
async fn prune_channels(channels: Arc<ChannelHub>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let pruned = channels.prune();
                if pruned > 0 {
                    tracing::debug!(pruned, "Pruned idle push topics");
                }
            }
        }
    }
}

/// Wait for Ctrl+C, then close every push connection so the graceful
/// shutdown is not held open by upgraded sockets.
async fn shutdown_signal(ws_manager: Arc<WsManager>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
    ws_manager.shutdown_all().await;
}
