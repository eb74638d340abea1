pub mod catalog;
pub mod concurrency;
pub mod destination;
pub mod engine;
pub mod error;
pub mod failpoints;
mod macros;
pub mod migration;
pub mod naming;
pub mod report;
pub mod sql;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;

pub use engine::TndEngine;
