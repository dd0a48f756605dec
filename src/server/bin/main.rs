use anyhow::Result;
use sqlx::sqlite::SqlitePool;
use tracing::info;
use warp::Filter;

use leadsheet::api;
use leadsheet::auth;
use leadsheet::config::Settings;
use leadsheet::db;
use leadsheet::error::handle_rejection;
use leadsheet::telemetry::{get_subscriber, init_subscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = get_subscriber("leadsheet".into(), "info".into());
    init_subscriber(subscriber)?;

    let settings = Settings::from_env()?;

    let pool = db::setup_pool(&settings.database_url).await?;
    db::setup_db(&pool).await?;
    auth::seed_admin(&pool, &settings).await?;

    let purged = db::purge_expired_sessions(&pool).await?;
    info!(purged, "expired sessions removed");

    run(pool, settings).await;

    Ok(())
}

async fn run(pool: SqlitePool, settings: Settings) {
    let addr = settings.bind_addr;
    let routes = api::routes(pool, settings)
        .recover(handle_rejection)
        .with(warp::trace::request());

    info!(%addr, "listening");
    warp::serve(routes).run(addr).await;
}
