use std::sync::Arc;

use ride_dispatch::api;
use ride_dispatch::config::{Config, LogFormat};
use ride_dispatch::engine::consumers::subscribe_all;
use ride_dispatch::error::AppError;
use ride_dispatch::ports::auth::{JwtVerifier, TokenVerifier};
use ride_dispatch::ports::broker::{
    DISPATCH_EXCHANGE, DRIVER_MATCHING_QUEUE, InMemoryBroker, RIDE_STATUS_QUEUE,
};
use ride_dispatch::state::AppState;
use tracing_subscriber::EnvFilter;

const DEV_JWT_SECRET: &str = "dev-secret";

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;
    init_tracing(&config);

    let secret = match config.jwt_secret.clone() {
        Some(secret) => secret,
        None => {
            tracing::warn!("JWT_SECRET not set; using the insecure development secret");
            DEV_JWT_SECRET.to_string()
        }
    };
    let verifier: Arc<dyn TokenVerifier> = Arc::new(JwtVerifier::new(secret.as_bytes()));

    let broker = Arc::new(InMemoryBroker::new());
    broker.bind(
        DRIVER_MATCHING_QUEUE,
        DISPATCH_EXCHANGE,
        &format!("{DRIVER_MATCHING_QUEUE}.#"),
    );
    broker.bind(RIDE_STATUS_QUEUE, DISPATCH_EXCHANGE, RIDE_STATUS_QUEUE);

    let (app_state, match_rx) = AppState::new(config.clone(), verifier, broker.clone());
    let shared_state = Arc::new(app_state);

    subscribe_all(broker.as_ref(), shared_state.coordinator.clone())
        .await
        .map_err(|err| AppError::Internal(format!("failed to subscribe consumers: {err}")))?;

    tokio::spawn(shared_state.coordinator.clone().run(match_rx));
    shared_state.coordinator.clone().spawn_sweeper();
    shared_state.hub.clone().spawn_reaper();
    shared_state.limiter.clone().spawn_sweeper(
        config.rate_limit.sweep_interval,
        config.rate_limit.idle_timeout,
    );

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    shared_state.hub.close_all();
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::new(config.log_level.clone());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
