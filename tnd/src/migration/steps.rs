use crate::error::TndResult;
use crate::migration::base::{Migration, MigrationContext, MigrationResult};
use crate::naming::LOADED_AT_COLUMN;
use crate::types::{AirbyteType, DestinationState, PrimitiveKind};

/// Copies a raw table written by the previous destination generation into the
/// current raw layout, then rebuilds the final table from it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyRawTable;

impl Migration for LegacyRawTable {
    fn version(&self) -> u32 {
        1
    }

    fn name(&self) -> &'static str {
        "legacy_raw_table"
    }

    fn apply(&self, state: DestinationState, context: &MigrationContext<'_>) -> TndResult<MigrationResult> {
        let tables = context.tables;
        if !tables.legacy_raw_table_exists || tables.raw_table_exists {
            return Ok(MigrationResult::unchanged(state));
        }

        Ok(MigrationResult {
            state: state.with_soft_reset(true),
            statements: context
                .generator
                .migrate_raw_table_from_legacy_format(&context.stream.id),
            requires_soft_reset_before_proceeding: false,
        })
    }
}

/// Adds `_airbyte_loaded_at` to final tables created before it existed.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinalTableLoadedAt;

impl Migration for FinalTableLoadedAt {
    fn version(&self) -> u32 {
        2
    }

    fn name(&self) -> &'static str {
        "final_table_loaded_at"
    }

    fn apply(&self, state: DestinationState, context: &MigrationContext<'_>) -> TndResult<MigrationResult> {
        let Some(final_table) = &context.tables.final_table else {
            return Ok(MigrationResult::unchanged(state));
        };
        if final_table.has_column(LOADED_AT_COLUMN) {
            return Ok(MigrationResult::unchanged(state));
        }

        let generator = context.generator;
        Ok(MigrationResult {
            state,
            statements: generator.add_column(
                &context.stream.id.final_table,
                LOADED_AT_COLUMN,
                generator.loaded_at_type(),
            ),
            requires_soft_reset_before_proceeding: false,
        })
    }
}

/// Rebuilds final tables whose `number` columns carry an outdated type.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericColumnRetype;

impl Migration for NumericColumnRetype {
    fn version(&self) -> u32 {
        3
    }

    fn name(&self) -> &'static str {
        "numeric_column_retype"
    }

    fn apply(&self, state: DestinationState, context: &MigrationContext<'_>) -> TndResult<MigrationResult> {
        let Some(final_table) = &context.tables.final_table else {
            return Ok(MigrationResult::unchanged(state));
        };

        let expected = context.generator.dialect().types.number.reported;
        let outdated = context.stream.columns.iter().any(|(column, ty)| {
            ty.choose() == AirbyteType::Primitive(PrimitiveKind::Number)
                && final_table
                    .column(&column.name)
                    .is_some_and(|existing| !existing.data_type.eq_ignore_ascii_case(expected))
        });

        if !outdated {
            return Ok(MigrationResult::unchanged(state));
        }

        Ok(MigrationResult {
            state: state.with_soft_reset(true),
            statements: crate::sql::Sql::empty(),
            requires_soft_reset_before_proceeding: true,
        })
    }
}
