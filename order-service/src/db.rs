//! Database pool construction.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;

/// Build the PostgreSQL pool for a component.
///
/// Every statement issued through this pool carries the acquire timeout as
/// an upper bound on waiting for a connection; in-flight transactions roll
/// back automatically when their task is cancelled.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.dsn)
        .await?;

    info!(max_connections = config.max_connections, "Database pool ready");
    Ok(pool)
}
