//! SQL generation. Nothing in here touches a connection.

mod cast;
pub mod dialect;
pub mod generator;
pub mod plan;

pub use dialect::{Dialect, DialectType, JsonSyntax, SafeCastStyle, TableSwap};
pub use generator::{BatchPlan, MergeOptions, RawTableStatus, RebuildSource, SqlGenerator};
pub use plan::Sql;
