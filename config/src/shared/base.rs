use thiserror::Error;

/// Errors returned by the `validate()` methods of the configuration sections.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`max_concurrent_streams` cannot be zero")]
    MaxConcurrentStreamsZero,
    #[error("`batch_size` cannot be zero")]
    BatchSizeZero,
    #[error("`retry.max_attempts` cannot be zero")]
    RetryMaxAttemptsZero,
    #[error("`retry.initial_backoff_ms` ({initial}) exceeds `retry.max_backoff_ms` ({max})")]
    RetryBackoffInverted { initial: u64, max: u64 },
    #[error("`statement_timeout_ms` cannot be zero")]
    StatementTimeoutZero,
    #[error("`{0}` is not a valid namespace")]
    InvalidNamespace(String),
    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
}
