//! Parallel execution of stream handlers.

pub mod pool;

pub use pool::{StreamWorkerPool, WorkerResult};
