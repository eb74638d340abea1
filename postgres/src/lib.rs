//! Postgres plumbing shared by the engine and the runner: the destination state
//! table, its migrations, and database helpers for tests.

pub mod db;
pub mod migrations;
pub mod state;

#[cfg(feature = "test-utils")]
pub mod test_utils;

/// Schema holding the engine's own bookkeeping tables.
pub const TND_SCHEMA: &str = "tnd";
