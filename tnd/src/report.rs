//! Per-stream and per-pass outcomes reported to the caller.

use std::fmt;

use serde::Serialize;

use crate::error::{ErrorCategory, ErrorKind, TndError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Succeeded,
    Failed,
}

/// Whether the orchestrator should schedule the attempt again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryHint {
    /// The same attempt may succeed later.
    Retry,
    /// Nothing changes until the declaration or configuration does.
    DoNotRetry,
    /// State must be inspected by an operator first.
    Escalate,
}

/// Structured description of a stream failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDescriptor {
    pub category: ErrorCategory,
    pub retry: RetryHint,
    pub reason: String,
    pub solution: &'static str,
}

impl FailureDescriptor {
    pub fn from_error(error: &TndError) -> Self {
        let kind = error.kind();
        let category = error.category();
        let retry = match category {
            ErrorCategory::Configuration => RetryHint::DoNotRetry,
            ErrorCategory::Execution => RetryHint::Retry,
            ErrorCategory::Fatal => RetryHint::Escalate,
        };

        Self {
            category,
            retry,
            reason: error.to_string(),
            solution: suggested_solution(kind),
        }
    }
}

fn suggested_solution(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidIdentifier | ErrorKind::IdentifierCollision => {
            "Rename the stream or field so it has a distinct legal name in the destination."
        }
        ErrorKind::InvalidSchema | ErrorKind::ConflictingSchema | ErrorKind::UnsupportedType => {
            "Fix the stream declaration in the catalog."
        }
        ErrorKind::PermissionDenied => {
            "Grant the destination user the privileges to create and modify tables in both namespaces."
        }
        ErrorKind::ConfigError | ErrorKind::EncryptionError => "Check the engine configuration.",
        ErrorKind::StateConflict => {
            "Another run is processing this stream. Make sure only one sync runs per stream."
        }
        ErrorKind::CorruptedState | ErrorKind::InvalidState => {
            "Inspect the stored destination state and the final table before the next sync."
        }
        ErrorKind::StreamWorkerPanic => "Report the panic; the stream can be retried.",
        ErrorKind::Cancelled => "The pass was cancelled; run it again.",
        _ => "Retry the sync. If the error persists, check the destination's health.",
    }
}

/// Outcome of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamReport {
    /// Declared `namespace.name`.
    pub stream: String,
    pub status: StreamStatus,
    /// Raw rows merged incrementally, or final rows written by a rebuild.
    pub rows_merged: u64,
    /// Final rows written by this pass with at least one nulled field.
    pub cast_errors: u64,
    /// The final table was rebuilt from the raw table.
    pub soft_reset: bool,
    pub failure: Option<FailureDescriptor>,
}

impl StreamReport {
    pub fn succeeded(stream: impl Into<String>, rows_merged: u64, cast_errors: u64, soft_reset: bool) -> Self {
        Self {
            stream: stream.into(),
            status: StreamStatus::Succeeded,
            rows_merged,
            cast_errors,
            soft_reset,
            failure: None,
        }
    }

    pub fn failed(stream: impl Into<String>, error: &TndError) -> Self {
        Self {
            stream: stream.into(),
            status: StreamStatus::Failed,
            rows_merged: 0,
            cast_errors: 0,
            soft_reset: false,
            failure: Some(FailureDescriptor::from_error(error)),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StreamStatus::Failed
    }
}

/// Outcome of a pass over all streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub streams: Vec<StreamReport>,
}

impl SyncReport {
    pub fn has_failures(&self) -> bool {
        self.streams.iter().any(StreamReport::is_failed)
    }

    pub fn failed_streams(&self) -> impl Iterator<Item = &StreamReport> {
        self.streams.iter().filter(|report| report.is_failed())
    }

    pub fn rows_merged(&self) -> u64 {
        self.streams.iter().map(|report| report.rows_merged).sum()
    }

    pub fn cast_errors(&self) -> u64 {
        self.streams.iter().map(|report| report.cast_errors).sum()
    }

    pub fn stream(&self, stream: &str) -> Option<&StreamReport> {
        self.streams.iter().find(|report| report.stream == stream)
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} streams, {} failed, {} rows merged, {} rows with cast errors",
            self.streams.len(),
            self.failed_streams().count(),
            self.rows_merged(),
            self.cast_errors()
        )
    }
}
