use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// SQL dialect of the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectKind {
    #[default]
    Postgres,
    Snowflake,
    Bigquery,
}

/// Backoff and attempt limits for transient execution errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Total attempts per transaction, including the first one.
    #[serde(default = "RetryConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryConfig::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "RetryConfig::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    const fn default_max_attempts() -> u32 {
        3
    }

    const fn default_initial_backoff_ms() -> u64 {
        500
    }

    const fn default_max_backoff_ms() -> u64 {
        10_000
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::RetryMaxAttemptsZero);
        }

        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ValidationError::RetryBackoffInverted {
                initial: self.initial_backoff_ms,
                max: self.max_backoff_ms,
            });
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
        }
    }
}

/// Settings of one typing-and-deduplication pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    #[serde(default)]
    pub dialect: DialectKind,
    /// Namespace holding the raw tables.
    #[serde(default = "EngineConfig::default_raw_namespace")]
    pub raw_namespace: String,
    /// Namespace of final tables for streams declared without one.
    #[serde(default = "EngineConfig::default_final_namespace")]
    pub default_namespace: String,
    /// Size of the stream worker pool.
    #[serde(default = "EngineConfig::default_max_concurrent_streams")]
    pub max_concurrent_streams: u16,
    /// Raw rows claimed per merge transaction.
    #[serde(default = "EngineConfig::default_batch_size")]
    pub batch_size: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "EngineConfig::default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    /// Mark every raw row as pending so the whole history is typed again.
    #[serde(default)]
    pub reprocess_raw_tables: bool,
}

impl EngineConfig {
    pub const DEFAULT_RAW_NAMESPACE: &'static str = "airbyte_internal";

    pub const DEFAULT_FINAL_NAMESPACE: &'static str = "public";

    fn default_raw_namespace() -> String {
        Self::DEFAULT_RAW_NAMESPACE.to_string()
    }

    fn default_final_namespace() -> String {
        Self::DEFAULT_FINAL_NAMESPACE.to_string()
    }

    const fn default_max_concurrent_streams() -> u16 {
        4
    }

    const fn default_batch_size() -> u64 {
        100_000
    }

    const fn default_statement_timeout_ms() -> u64 {
        30 * 60 * 1000
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_concurrent_streams == 0 {
            return Err(ValidationError::MaxConcurrentStreamsZero);
        }

        if self.batch_size == 0 {
            return Err(ValidationError::BatchSizeZero);
        }

        if self.statement_timeout_ms == 0 {
            return Err(ValidationError::StatementTimeoutZero);
        }

        if self.raw_namespace.trim().is_empty() {
            return Err(ValidationError::InvalidNamespace(self.raw_namespace.clone()));
        }

        if self.default_namespace.trim().is_empty() {
            return Err(ValidationError::InvalidNamespace(
                self.default_namespace.clone(),
            ));
        }

        self.retry.validate()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dialect: DialectKind::default(),
            raw_namespace: Self::default_raw_namespace(),
            default_namespace: Self::default_final_namespace(),
            max_concurrent_streams: Self::default_max_concurrent_streams(),
            batch_size: Self::default_batch_size(),
            retry: RetryConfig::default(),
            statement_timeout_ms: Self::default_statement_timeout_ms(),
            reprocess_raw_tables: false,
        }
    }
}
