//! Everything that talks to the destination warehouse.

pub mod executor;
pub mod handler;
pub mod metadata;
pub mod postgres;
pub mod retry;

pub use self::executor::{ExecutorFactory, QueryRow, SqlExecutor};
pub use self::handler::{DestinationHandler, HandlerPhase, HandlerSettings, StreamOutcome};
pub use self::postgres::{PgExecutor, PgExecutorFactory};
pub use self::retry::RetryPolicy;
