use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.postgres.url())
        .await
        .with_context(|| {
            format!(
                "failed to connect to postgres at {}:{}",
                config.postgres.host, config.postgres.port
            )
        })?;
    Ok(pool)
}
