use config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::{Executor, postgres::PgPoolOptions};
use tracing::info;

use crate::TND_SCHEMA;

/// Applies the state-store migrations inside the `tnd` schema of the destination.
///
/// The search path is pinned to `tnd` so sqlx keeps its `_sqlx_migrations` table
/// there instead of in `public`.
pub async fn apply_state_store_migrations(
    connection_config: &PgConnectionConfig,
) -> Result<(), sqlx::Error> {
    let options = connection_config.with_db();

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute(format!("create schema if not exists {TND_SCHEMA};").as_str())
                    .await?;
                conn.execute(format!("set search_path = '{TND_SCHEMA}';").as_str())
                    .await?;

                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    info!("applying state store migrations");

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("state store migrations applied");

    pool.close().await;

    Ok(())
}
