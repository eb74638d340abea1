use std::{
    io,
    path::{Path, PathBuf},
};

use rust_cli_config::{Environment as EnvSource, File};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Env variable naming the configuration directory; `./configuration` when unset.
pub const CONFIGURATION_DIR_ENV_NAME: &str = "TND_CONFIGURATION_DIR";

const DEFAULT_CONFIGURATION_DIR: &str = "configuration";

const BASE_STEM: &str = "base";

const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Overrides look like `APP_ENGINE__BATCH_SIZE=500`.
const ENV_PREFIX: &str = "APP";

const ENV_NESTING: &str = "__";

/// A configuration value that can be loaded from the configuration directory.
pub trait Config: DeserializeOwned {
    /// Rewrites relative paths held by the value so they point inside `directory`.
    ///
    /// The default leaves the value untouched.
    fn anchor_paths(&mut self, directory: &Path) {
        let _ = directory;
    }
}

#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    NoDirectory(PathBuf),

    #[error("no base configuration in `{0}`; expected base.yaml, base.yml or base.json")]
    NoBaseFile(PathBuf),

    #[error("more than one `{stem}` file in `{directory}`")]
    AmbiguousFile { stem: String, directory: PathBuf },

    #[error("invalid configuration file `{path}`: {source}")]
    InvalidFile {
        path: PathBuf,
        source: rust_cli_config::ConfigError,
    },

    #[error("invalid `APP_` environment override: {0}")]
    InvalidOverride(#[source] rust_cli_config::ConfigError),

    #[error("configuration is incomplete or malformed: {0}")]
    Deserialization(#[source] rust_cli_config::ConfigError),

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[source] io::Error),
}

/// Directory holding `base.*`, the optional `{environment}.*` overlay and files they refer to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDirectory {
    path: PathBuf,
}

impl ConfigDirectory {
    /// Uses `TND_CONFIGURATION_DIR`, else `./configuration`.
    pub fn locate() -> Result<Self, LoadConfigError> {
        let path = match std::env::var_os(CONFIGURATION_DIR_ENV_NAME) {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir()
                .map_err(LoadConfigError::CurrentDir)?
                .join(DEFAULT_CONFIGURATION_DIR),
        };

        Self::at(path)
    }

    pub fn at(path: impl Into<PathBuf>) -> Result<Self, LoadConfigError> {
        let path = path.into();
        if !path.is_dir() {
            return Err(LoadConfigError::NoDirectory(path));
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Joins a relative path onto the directory; absolute paths are returned as they are.
    pub fn anchor(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            self.path.join(path)
        } else {
            path.to_path_buf()
        }
    }

    /// Finds the single file named `{stem}.{yaml|yml|json}`.
    fn file(&self, stem: &str) -> Result<Option<PathBuf>, LoadConfigError> {
        let mut found = EXTENSIONS
            .iter()
            .map(|extension| self.path.join(format!("{stem}.{extension}")))
            .filter(|candidate| candidate.is_file());

        let first = found.next();
        if found.next().is_some() {
            return Err(LoadConfigError::AmbiguousFile {
                stem: stem.to_owned(),
                directory: self.path.clone(),
            });
        }

        Ok(first)
    }

    /// Merges `base`, the environment overlay if present, then `APP_` env overrides.
    pub fn load<T: Config>(&self, environment: Environment) -> Result<T, LoadConfigError> {
        let base = self
            .file(BASE_STEM)?
            .ok_or_else(|| LoadConfigError::NoBaseFile(self.path.clone()))?;
        let overlay = self.file(environment.as_str())?;

        let mut builder = rust_cli_config::Config::builder();
        for path in std::iter::once(base).chain(overlay) {
            builder = builder.add_source(File::from(path.clone()));
            // Building after each file attributes a parse error to the file that caused it.
            builder
                .build_cloned()
                .map_err(|source| LoadConfigError::InvalidFile { path, source })?;
        }

        let merged = builder
            .add_source(
                EnvSource::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator(ENV_NESTING)
                    .try_parsing(true),
            )
            .build()
            .map_err(LoadConfigError::InvalidOverride)?;

        let mut value: T = merged
            .try_deserialize()
            .map_err(LoadConfigError::Deserialization)?;
        value.anchor_paths(&self.path);

        Ok(value)
    }
}

/// Loads `T` from the located configuration directory for the `APP_ENVIRONMENT` environment.
pub fn load_config<T: Config>() -> Result<T, LoadConfigError> {
    let environment = Environment::load().map_err(LoadConfigError::Environment)?;

    ConfigDirectory::locate()?.load(environment)
}
