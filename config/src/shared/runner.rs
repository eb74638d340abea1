use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Config;
use crate::shared::{EngineConfig, PgConnectionConfig, StateStoreConfig, ValidationError};

/// Complete configuration of the runner binary.
///
/// Does not implement [`serde::Serialize`] so the destination password cannot leak
/// through a serialized form.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Destination database the merges run against.
    pub destination: PgConnectionConfig,
    #[serde(default)]
    pub state_store: StateStoreConfig,
    /// Catalog JSON file; a relative path is read from the configuration directory.
    pub catalog_path: PathBuf,
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.engine.validate()?;
        self.destination.validate()
    }
}

impl Config for RunnerConfig {
    fn anchor_paths(&mut self, directory: &Path) {
        if self.catalog_path.is_relative() {
            self.catalog_path = directory.join(&self.catalog_path);
        }
    }
}
