//! Error types for typing-and-deduplication runs.
//!
//! [`TndError`] carries a classified [`ErrorKind`], a static description, optional
//! dynamic detail, the originating error and the callsite.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Result type used throughout the engine.
pub type TndResult<T> = Result<T, TndError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Error type of the engine.
#[derive(Debug, Clone)]
pub struct TndError {
    payload: Box<ErrorPayload>,
}

/// Classification of engine failures.
///
/// Every kind belongs to one [`ErrorCategory`], which decides whether a failure is
/// retried locally and how it is reported.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Configuration
    InvalidIdentifier,
    IdentifierCollision,
    UnsupportedType,
    InvalidSchema,
    ConflictingSchema,
    ConfigError,
    PermissionDenied,

    // Execution
    DestinationConnectionFailed,
    DestinationQueryFailed,
    DestinationIoError,
    DataConversion,
    StatementTimeout,
    TransactionConflict,
    Cancelled,
    StateStoreFailed,

    // Fatal
    CorruptedState,
    StateConflict,
    InvalidState,
    StreamWorkerPanic,

    // IO & serialization
    IoError,
    SerializationError,
    DeserializationError,
    EncryptionError,

    Unknown,

    // Kinds raised only by fault injection in tests.
    #[cfg(feature = "failpoints")]
    WithTransientFailure,
    #[cfg(feature = "failpoints")]
    WithFatalFailure,
}

/// Coarse grouping of [`ErrorKind`]s used for retry decisions and reports.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Wrong input or declaration. Never retried.
    Configuration,
    /// The destination misbehaved. Transient kinds are retried locally.
    Execution,
    /// Persisted state cannot be trusted. Needs an operator.
    Fatal,
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::InvalidIdentifier
            | ErrorKind::IdentifierCollision
            | ErrorKind::UnsupportedType
            | ErrorKind::InvalidSchema
            | ErrorKind::ConflictingSchema
            | ErrorKind::ConfigError
            | ErrorKind::PermissionDenied
            | ErrorKind::EncryptionError => ErrorCategory::Configuration,
            ErrorKind::CorruptedState
            | ErrorKind::StateConflict
            | ErrorKind::InvalidState
            | ErrorKind::StreamWorkerPanic => ErrorCategory::Fatal,
            #[cfg(feature = "failpoints")]
            ErrorKind::WithFatalFailure => ErrorCategory::Fatal,
            _ => ErrorCategory::Execution,
        }
    }

    /// Whether retrying the same transaction may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ErrorKind::DestinationConnectionFailed
            | ErrorKind::DestinationIoError
            | ErrorKind::StatementTimeout
            | ErrorKind::TransactionConflict
            | ErrorKind::StateStoreFailed => true,
            #[cfg(feature = "failpoints")]
            ErrorKind::WithTransientFailure => true,
            _ => false,
        }
    }
}

impl TndError {
    pub fn kind(&self) -> ErrorKind {
        self.payload.kind
    }

    /// Category of [`TndError::kind`].
    pub fn category(&self) -> ErrorCategory {
        self.kind().category()
    }

    pub fn description(&self) -> &str {
        &self.payload.description
    }

    pub fn detail(&self) -> Option<&str> {
        self.payload.detail.as_deref()
    }

    pub fn backtrace(&self) -> &Backtrace {
        self.payload.backtrace.as_ref()
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.payload.location
    }

    /// Attaches the originating error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        self.payload.source = Some(Arc::new(source));
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        TndError {
            payload: Box::new(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }

    #[track_caller]
    fn from_source<E>(kind: ErrorKind, description: &'static str, err: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        let detail = err.to_string();
        TndError::from_source_with_detail(kind, description, detail, err)
    }

    #[track_caller]
    fn from_source_with_detail<E>(kind: ErrorKind, description: &'static str, detail: String, err: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        TndError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl PartialEq for TndError {
    fn eq(&self, other: &TndError) -> bool {
        self.payload.kind == other.payload.kind
    }
}

impl Hash for TndError {
    /// Hashes kind and static description only, so repeated occurrences group together.
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.payload.kind.hash(state);
        self.payload.description.hash(state);
    }
}

impl fmt::Display for TndError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = &self.payload;
        let location = payload.location;
        write!(
            f,
            "[{:?}] {} @ {}:{}:{}",
            payload.kind,
            payload.description,
            location.file(),
            location.line(),
            location.column()
        )?;

        if let Some(detail) = payload.detail.as_deref() {
            write_block(f, "Detail", detail)?;
        }

        let backtrace = payload.backtrace.to_string();
        if !backtrace.trim().is_empty() {
            write_block(f, "Backtrace", &backtrace)?;
        }

        Ok(())
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, title: &str, body: &str) -> fmt::Result {
    if body.trim().is_empty() {
        return write!(f, "\n  {title}: <empty>");
    }

    write!(f, "\n  {title}:")?;
    for line in body.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl error::Error for TndError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.payload
            .source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn error::Error + 'static))
    }
}

impl From<(ErrorKind, &'static str)> for TndError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> TndError {
        TndError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for TndError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> TndError {
        TndError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

impl From<std::io::Error> for TndError {
    #[track_caller]
    fn from(err: std::io::Error) -> TndError {
        TndError::from_source(ErrorKind::IoError, "I/O operation failed", err)
    }
}

impl From<serde_json::Error> for TndError {
    #[track_caller]
    fn from(err: serde_json::Error) -> TndError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        TndError::from_source(kind, description, err)
    }
}

/// Maps destination SQLSTATEs onto engine kinds.
///
/// Connection (08), resource (53) and operator (57) classes are transient, data
/// exceptions (22) are conversion failures and transaction rollbacks (40) are
/// retryable conflicts.
impl From<tokio_postgres::Error> for TndError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> TndError {
        let (kind, description) = match err.code() {
            Some(sqlstate) => classify_sqlstate(sqlstate.code()),
            None if err.is_closed() => (
                ErrorKind::DestinationConnectionFailed,
                "Destination connection closed",
            ),
            None => (
                ErrorKind::DestinationConnectionFailed,
                "Destination connection failed",
            ),
        };

        let detail = match err.as_db_error() {
            Some(db) => server_detail(
                db.severity(),
                db.code().code(),
                db.message(),
                db.detail(),
                db.hint(),
            ),
            None => err.to_string(),
        };

        TndError::from_source_with_detail(kind, description, detail, err)
    }
}

/// Report line for an error raised by the destination server.
fn server_detail(
    severity: &str,
    code: &str,
    message: &str,
    detail: Option<&str>,
    hint: Option<&str>,
) -> String {
    let mut text = format!("{severity}: {message} (SQLSTATE {code})");
    if let Some(detail) = detail {
        text.push_str(&format!("\nDETAIL: {detail}"));
    }
    if let Some(hint) = hint {
        text.push_str(&format!("\nHINT: {hint}"));
    }
    text
}

/// Classifies a five-character SQLSTATE.
pub(crate) fn classify_sqlstate(code: &str) -> (ErrorKind, &'static str) {
    match code {
        "57014" => (ErrorKind::StatementTimeout, "Destination statement canceled"),
        "42501" => (ErrorKind::PermissionDenied, "Destination permission denied"),
        "3D000" | "3F000" => (ErrorKind::ConfigError, "Destination namespace does not exist"),
        _ => match code.get(..2) {
            Some("08") => (
                ErrorKind::DestinationConnectionFailed,
                "Destination connection failed",
            ),
            Some("53") => (
                ErrorKind::DestinationConnectionFailed,
                "Destination ran out of resources",
            ),
            Some("57") => (
                ErrorKind::DestinationConnectionFailed,
                "Destination operator intervention",
            ),
            Some("58") => (ErrorKind::DestinationIoError, "Destination system error"),
            Some("22") => (ErrorKind::DataConversion, "Destination data conversion failed"),
            Some("40") => (
                ErrorKind::TransactionConflict,
                "Destination transaction rolled back",
            ),
            Some("28") => (
                ErrorKind::PermissionDenied,
                "Destination authentication failed",
            ),
            Some("XX") => (ErrorKind::DestinationQueryFailed, "Destination internal error"),
            _ => (ErrorKind::DestinationQueryFailed, "Destination query failed"),
        },
    }
}

impl From<sqlx::Error> for TndError {
    #[track_caller]
    fn from(err: sqlx::Error) -> TndError {
        let (kind, description) = match &err {
            sqlx::Error::Database(db) => classify_state_store_sqlstate(db.code().as_deref()),
            sqlx::Error::Io(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::Tls(_) => (
                ErrorKind::StateStoreFailed,
                "State store connection failed",
            ),
            sqlx::Error::Migrate(_) => (ErrorKind::ConfigError, "State store migration failed"),
            _ => (ErrorKind::StateStoreFailed, "State store operation failed"),
        };

        TndError::from_source(kind, description, err)
    }
}

/// State store failures worth retrying are connection losses and rolled back
/// transactions. Any other server error fails the query without retry.
fn classify_state_store_sqlstate(code: Option<&str>) -> (ErrorKind, &'static str) {
    match code.and_then(|code| code.get(..2)) {
        Some("08") | Some("40") => (ErrorKind::StateStoreFailed, "State store query failed"),
        _ => (ErrorKind::DestinationQueryFailed, "State store query failed"),
    }
}

impl From<rustls::Error> for TndError {
    #[track_caller]
    fn from(err: rustls::Error) -> TndError {
        TndError::from_source(ErrorKind::EncryptionError, "TLS configuration failed", err)
    }
}
