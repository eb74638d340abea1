//! Versioned upgrades of existing destination tables.
//!
//! Every stream's [`crate::types::DestinationState`] records the highest migration
//! version applied to its tables. Migrations ahead of that marker run in order
//! before the stream is merged.

pub mod base;
pub mod runner;
pub mod steps;

pub use base::{Migration, MigrationContext, MigrationResult};
pub use runner::{MigrationOutcome, MigrationRunner};
pub use steps::{FinalTableLoadedAt, LegacyRawTable, NumericColumnRetype};
