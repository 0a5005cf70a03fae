use identity_backend::{config::Config, db::connection::create_pool, state::AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "identity_backend=info,token_cleanup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    let pool = create_pool(&config.database_url).await?;
    let state = AppState::with_pool(config, &pool)?;

    let deleted_sessions = state.sessions.cleanup_expired().await?;
    let purged_attempts = state.guard.purge_expired().await?;

    sqlx::query("VACUUM (ANALYZE) refresh_tokens")
        .execute(pool.as_ref())
        .await?;
    sqlx::query("VACUUM (ANALYZE) login_attempts")
        .execute(pool.as_ref())
        .await?;

    tracing::info!(deleted_sessions, purged_attempts, "Cleanup finished");
    Ok(())
}
