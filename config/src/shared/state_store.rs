use serde::{Deserialize, Serialize};

/// Where per-stream destination state is persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateStoreConfig {
    /// Process-local map, lost on exit. Useful for tests and dry runs.
    #[default]
    Memory,
    /// The `tnd.destination_state` table inside the destination database.
    Postgres,
}
