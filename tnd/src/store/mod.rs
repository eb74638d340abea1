//! Persistence of per-stream [`crate::types::DestinationState`].

pub mod base;
pub mod memory;
pub mod postgres;

pub use self::base::DestinationStateStore;
pub use self::memory::MemoryStateStore;
pub use self::postgres::PostgresStateStore;
