use identity_backend::{
    config::{mask_secret, Config},
    db::connection::create_pool,
    state::AppState,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "identity_backend=info,maintenance_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    tracing::info!(
        database_url = %config.database_url,
        jwt_secret = %mask_secret(&config.token.secret),
        session_sweep_interval_seconds = config.maintenance.session_sweep_interval_seconds,
        attempt_sweep_interval_seconds = config.maintenance.attempt_sweep_interval_seconds,
        attempt_retention_days = config.rate_limit.attempt_retention_days,
        "Loaded configuration from environment/.env"
    );

    let pool = create_pool(&config.database_url).await?;
    let state = AppState::with_pool(config, &pool)?;
    state
        .maintenance_worker()
        .run_until(shutdown_signal())
        .await;
    Ok(())
}
