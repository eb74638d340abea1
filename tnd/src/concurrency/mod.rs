//! Coordination primitives shared by the engine and its stream workers.
//!
//! [`shutdown`] broadcasts a single cancellation request to every worker. Workers
//! observe it between transactions and while a transaction is in flight; an
//! interrupted transaction is rolled back, never half-applied.

pub mod shutdown;
pub mod signal;
