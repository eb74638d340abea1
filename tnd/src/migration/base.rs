use crate::error::TndResult;
use crate::sql::{Sql, SqlGenerator};
use crate::types::{DestinationState, ExistingTables, StreamConfig};

/// What a migration gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct MigrationContext<'a> {
    pub stream: &'a StreamConfig,
    /// Tables as described before any migration of this pass ran.
    pub tables: &'a ExistingTables,
    pub generator: &'a SqlGenerator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult {
    pub state: DestinationState,
    pub statements: Sql,
    /// Later migrations must wait until the final table has been rebuilt.
    pub requires_soft_reset_before_proceeding: bool,
}

impl MigrationResult {
    /// Nothing to do besides recording the version.
    pub fn unchanged(state: DestinationState) -> Self {
        Self {
            state,
            statements: Sql::empty(),
            requires_soft_reset_before_proceeding: false,
        }
    }
}

/// One upgrade step.
///
/// Applicability is decided by [`Migration::version`] alone: the runner never calls
/// [`Migration::apply`] for a state already at or past that version. `apply` itself
/// inspects the tables and may produce no statements.
pub trait Migration: Send + Sync {
    fn version(&self) -> u32;

    fn name(&self) -> &'static str;

    fn apply(&self, state: DestinationState, context: &MigrationContext<'_>) -> TndResult<MigrationResult>;
}
