use std::time::Duration;

use config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::{PgPool, postgres::PgPoolOptions};

/// Idle connections are closed after this long so a finished pass holds nothing open.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds a pool on the `tnd` schema that opens connections on first use.
pub fn connect_state_store_pool(config: &PgConnectionConfig, max_connections: u32) -> PgPool {
    let options = config.with_db();

    PgPoolOptions::new()
        .min_connections(0)
        .max_connections(max_connections)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .connect_lazy_with(options)
}
