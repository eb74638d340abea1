mod base;
mod connection;
mod engine;
mod runner;
mod state_store;

pub use base::*;
pub use connection::*;
pub use engine::*;
pub use runner::*;
pub use state_store::*;
