use tracing::info;

use crate::bail;
use crate::error::{ErrorKind, TndResult};
use crate::migration::base::{Migration, MigrationContext};
use crate::migration::steps::{FinalTableLoadedAt, LegacyRawTable, NumericColumnRetype};
use crate::sql::Sql;
use crate::types::DestinationState;

/// Result of [`MigrationRunner::apply_due`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub state: DestinationState,
    /// Statements of every applied migration, in order.
    pub statements: Sql,
    pub applied: Vec<&'static str>,
    /// A migration stopped the run until the final table is rebuilt.
    pub halted: bool,
}

/// Applies the migrations a stream's state has not seen yet.
pub struct MigrationRunner {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRunner {
    /// Fails unless versions are strictly increasing.
    pub fn new(migrations: Vec<Box<dyn Migration>>) -> TndResult<Self> {
        for pair in migrations.windows(2) {
            if pair[0].version() >= pair[1].version() {
                bail!(
                    ErrorKind::InvalidState,
                    "Migrations are not ordered by version",
                    format!(
                        "`{}` (v{}) precedes `{}` (v{})",
                        pair[0].name(),
                        pair[0].version(),
                        pair[1].name(),
                        pair[1].version()
                    )
                );
            }
        }

        Ok(Self { migrations })
    }

    /// The built-in migrations.
    pub fn standard() -> Self {
        Self {
            migrations: vec![
                Box::new(LegacyRawTable),
                Box::new(FinalTableLoadedAt),
                Box::new(NumericColumnRetype),
            ],
        }
    }

    /// Version a fully migrated stream ends up at.
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map_or(0, |migration| migration.version())
    }

    /// Folds every due migration over `state`.
    ///
    /// Stops after the first migration that requires a soft reset; the remaining
    /// ones run on a later pass, against the rebuilt table.
    pub fn apply_due(
        &self,
        state: DestinationState,
        context: &MigrationContext<'_>,
    ) -> TndResult<MigrationOutcome> {
        let mut outcome = MigrationOutcome {
            state,
            statements: Sql::empty(),
            applied: Vec::new(),
            halted: false,
        };

        for migration in &self.migrations {
            if migration.version() <= outcome.state.version {
                continue;
            }

            let result = migration.apply(outcome.state, context)?;
            info!(
                stream = %context.stream.id,
                migration = migration.name(),
                version = migration.version(),
                statements = result.statements.statements().count(),
                "applying migration"
            );

            outcome.state = DestinationState {
                version: migration.version(),
                ..result.state
            };
            outcome.statements = Sql::concat([outcome.statements, result.statements]);
            outcome.applied.push(migration.name());

            if result.requires_soft_reset_before_proceeding {
                outcome.halted = true;
                break;
            }
        }

        Ok(outcome)
    }
}

impl std::fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.migrations.iter().map(|migration| migration.name()))
            .finish()
    }
}
