use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Connects eagerly so a misconfigured or unreachable database fails the run
/// up front instead of surfacing halfway through a batch.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(8))
        .connect(database_url)
        .await
        .with_context(|| format!("failed to connect to database at {database_url}"))
}
