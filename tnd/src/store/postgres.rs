use config::shared::PgConnectionConfig;
use sqlx::PgPool;
use tracing::debug;

use crate::bail;
use crate::error::{ErrorKind, TndResult};
use crate::store::base::DestinationStateStore;
use crate::tnd_error;
use crate::types::{DestinationState, StreamId, VersionedState};

/// Connections kept by the state store pool. Each stream worker needs at most one.
const MAX_CONNECTIONS: u32 = 4;

/// [`DestinationStateStore`] backed by the `tnd.destination_state` table.
///
/// The table must exist; see `postgres::migrations::apply_state_store_migrations`.
#[derive(Debug, Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(config: &PgConnectionConfig) -> Self {
        Self {
            pool: postgres::db::connect_state_store_pool(config, MAX_CONNECTIONS),
        }
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl DestinationStateStore for PostgresStateStore {
    async fn get_state(&self, stream: &StreamId) -> TndResult<VersionedState> {
        let row = postgres::state::get_destination_state(
            &self.pool,
            &stream.original_namespace,
            &stream.original_name,
        )
        .await?;

        let Some(row) = row else {
            return Ok(VersionedState::default());
        };

        let state: DestinationState = serde_json::from_value(row.state).map_err(|err| {
            tnd_error!(
                ErrorKind::CorruptedState,
                "Stored destination state cannot be parsed",
                format!("stream {stream}"),
                source: err
            )
        })?;
        let revision = u64::try_from(row.revision).map_err(|_| {
            tnd_error!(
                ErrorKind::CorruptedState,
                "Stored destination state has a negative revision",
                format!("stream {stream} has revision {}", row.revision)
            )
        })?;

        Ok(VersionedState { state, revision })
    }

    async fn set_state(
        &self,
        stream: &StreamId,
        expected_revision: u64,
        state: DestinationState,
    ) -> TndResult<u64> {
        let value = serde_json::to_value(state)?;
        let expected = i64::try_from(expected_revision).map_err(|_| {
            tnd_error!(
                ErrorKind::InvalidState,
                "Revision does not fit the state table",
                expected_revision
            )
        })?;

        let new_revision = postgres::state::compare_and_set_destination_state(
            &self.pool,
            &stream.original_namespace,
            &stream.original_name,
            expected,
            &value,
        )
        .await?;

        let Some(new_revision) = new_revision else {
            bail!(
                ErrorKind::StateConflict,
                "Destination state was modified concurrently",
                format!("stream {stream} is no longer at revision {expected_revision}")
            );
        };

        debug!(stream = %stream, revision = new_revision, "persisted destination state");

        // Revisions start at 1 and only grow.
        Ok(new_revision.unsigned_abs())
    }
}
