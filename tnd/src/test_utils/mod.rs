//! Helpers for testing handlers and the engine without a destination.
//!
//! [`executor::MockExecutor`] records every transaction and answers queries from a
//! script, [`fixtures`] builds streams and scripts matching them.

pub mod executor;
pub mod failpoints;
pub mod fixtures;

pub use executor::{MockExecutor, MockExecutorFactory};
