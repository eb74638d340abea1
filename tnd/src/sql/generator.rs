//! Statement plans for creating, merging into and rebuilding final tables.
//!
//! Every raw row taken by a merge is first stamped with the merge's `loaded_at`
//! value. The rest of the plan then addresses the batch as "raw rows carrying this
//! stamp", which keeps the batch stable no matter how many rows are appended
//! concurrently.

use chrono::{DateTime, Utc};

use crate::bail;
use crate::error::{ErrorKind, TndResult};
use crate::naming::{
    DATA_COLUMN, EXTRACTED_AT_COLUMN, LOADED_AT_COLUMN, META_COLUMN, RAW_ID_COLUMN,
};
use crate::sql::cast::{self, PG_SAFE_CAST_FUNCTION};
use crate::sql::dialect::{Dialect, DialectType, JsonSyntax, SafeCastStyle, TableSwap};
use crate::sql::plan::Sql;
use crate::types::{LiveTable, StagingTable, StreamConfig, StreamId, TableDefinition, TableRef};

const ROW_NUMBER_COLUMN: &str = "_airbyte_row_number";

/// Parameters of one merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    /// Stamp written to consumed raw rows and to the final rows they produce.
    pub loaded_at: DateTime<Utc>,
    /// Raw rows claimed per incremental batch.
    pub batch_size: u64,
    /// Null out malformed values instead of failing the statement.
    pub safer_casting: bool,
}

/// Which raw rows a rebuild reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildSource {
    /// Every raw row ever written. Used by soft resets.
    FullHistory,
    /// Only the rows no earlier pass has loaded. Used by overwrite syncs.
    CurrentPass,
}

/// A plan that claims raw rows with the merge stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub sql: Sql,
    /// Position of the claiming `UPDATE` among all statements of `sql`.
    pub claim_position: usize,
    /// Position of the `INSERT` writing typed rows.
    pub written_position: usize,
}

/// Timestamps summarizing a raw table, as returned by [`SqlGenerator::raw_table_status`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTableStatus {
    /// One second before the oldest unloaded row; `None` when nothing is pending.
    pub min_unloaded_extracted_at: Option<String>,
    pub max_extracted_at: Option<String>,
}

impl RawTableStatus {
    pub fn has_unloaded_rows(&self) -> bool {
        self.min_unloaded_extracted_at.is_some()
    }
}

/// Generates SQL plans for one dialect. Stateless and cheap to clone.
#[derive(Debug, Clone)]
pub struct SqlGenerator {
    dialect: Dialect,
}

impl SqlGenerator {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn q(&self, identifier: &str) -> String {
        self.dialect.quote(identifier)
    }

    fn timestamp_type(&self) -> &'static str {
        self.dialect.types.timestamp_with_timezone.ddl
    }

    fn document_type(&self) -> &'static str {
        self.dialect.types.document.ddl
    }

    /// Runs `statements` in one transaction when the dialect allows DDL inside
    /// transactions, one by one otherwise.
    fn ddl_plan(&self, statements: Vec<String>) -> Sql {
        if self.dialect.transactional_ddl {
            Sql::transactionally(statements)
        } else {
            Sql::separately(statements)
        }
    }

    pub fn create_schema(&self, namespace: &str) -> Sql {
        Sql::of(format!("CREATE SCHEMA IF NOT EXISTS {}", self.q(namespace)))
    }

    pub fn create_raw_table(&self, id: &StreamId) -> Sql {
        let types = &self.dialect.types;
        Sql::of(format!(
            "CREATE TABLE IF NOT EXISTS {} ({} {} NOT NULL, {} {} NOT NULL, {} {}, {} {} NOT NULL, {} {})",
            self.dialect.table(&id.raw),
            self.q(RAW_ID_COLUMN),
            types.raw_id.ddl,
            self.q(EXTRACTED_AT_COLUMN),
            self.timestamp_type(),
            self.q(LOADED_AT_COLUMN),
            self.timestamp_type(),
            self.q(DATA_COLUMN),
            self.document_type(),
            self.q(META_COLUMN),
            self.document_type(),
        ))
    }

    /// System columns of final tables with their types, in table order.
    fn final_system_columns(&self) -> [(&'static str, DialectType); 4] {
        let types = &self.dialect.types;
        [
            (RAW_ID_COLUMN, types.raw_id),
            (EXTRACTED_AT_COLUMN, types.timestamp_with_timezone),
            (LOADED_AT_COLUMN, types.timestamp_with_timezone),
            (META_COLUMN, types.document),
        ]
    }

    fn create_table_statement(&self, stream: &StreamConfig, table: &TableRef, if_not_exists: bool) -> String {
        let mut columns: Vec<String> = self
            .final_system_columns()
            .iter()
            .map(|(name, ty)| format!("{} {} NOT NULL", self.q(name), ty.ddl))
            .collect();
        columns.extend(stream.columns.iter().map(|(column, ty)| {
            format!("{} {}", self.q(&column.name), self.dialect.type_for(ty).ddl)
        }));

        format!(
            "CREATE TABLE {}{} ({})",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            self.dialect.table(table),
            columns.join(", ")
        )
    }

    /// Declares the final table (plus `suffix`) with system and declared columns.
    ///
    /// With `force`, an existing table of that name is dropped first.
    pub fn create_final_table(&self, stream: &StreamConfig, suffix: &str, force: bool) -> Sql {
        let table = stream.id.final_table.with_suffix(suffix, &self.dialect.naming);
        if !force {
            return Sql::of(self.create_table_statement(stream, &table, true));
        }

        self.ddl_plan(vec![
            format!("DROP TABLE IF EXISTS {}", self.dialect.table(&table)),
            self.create_table_statement(stream, &table, false),
        ])
    }

    /// The existing final table has exactly the columns and types this stream declares.
    pub fn existing_schema_matches(&self, stream: &StreamConfig, existing: &TableDefinition) -> bool {
        let mut expected: Vec<(&str, &str)> = self
            .final_system_columns()
            .iter()
            .map(|(name, ty)| (*name, ty.reported))
            .collect();
        expected.extend(
            stream
                .columns
                .iter()
                .map(|(column, ty)| (column.name.as_str(), self.dialect.type_for(ty).reported)),
        );

        existing.columns.len() == expected.len()
            && expected.iter().all(|(name, reported)| {
                existing
                    .column(name)
                    .is_some_and(|column| column.data_type.eq_ignore_ascii_case(reported))
            })
    }

    /// The session helper needed by safer casting, if the dialect has one.
    fn safe_cast_prelude(&self, safer_casting: bool) -> Option<String> {
        (safer_casting && self.dialect.safe_cast == SafeCastStyle::PgTempFunction)
            .then(|| PG_SAFE_CAST_FUNCTION.to_string())
    }

    /// Checks that the stream can be merged by this dialect.
    fn validate(&self, stream: &StreamConfig) -> TndResult<()> {
        if stream.is_dedup() && !self.dialect.window_functions {
            bail!(
                ErrorKind::UnsupportedType,
                "Deduplication needs window functions",
                format!("stream {} is append+dedup on a dialect without window functions", stream.id)
            );
        }

        for key in &stream.primary_key {
            if stream.column_type(key).is_none() {
                bail!(
                    ErrorKind::InvalidSchema,
                    "Primary key column is not declared",
                    format!("stream {} has no column `{}`", stream.id, key.original)
                );
            }
        }

        Ok(())
    }

    /// One incremental batch: claim up to `batch_size` unloaded raw rows and merge them.
    pub fn update_table(&self, stream: &StreamConfig, options: &MergeOptions) -> TndResult<BatchPlan> {
        self.validate(stream)?;

        let stamp = self.dialect.timestamp_literal(options.loaded_at);
        let raw = self.dialect.table(&stream.id.raw);
        let live = &stream.id.final_table;

        let mut statements = Vec::new();
        statements.extend(self.safe_cast_prelude(options.safer_casting));

        let claim_position = statements.len();
        statements.push(format!(
            "UPDATE {raw} SET {loaded} = {stamp} WHERE {loaded} IS NULL AND {raw_id} IN (SELECT {raw_id} FROM {raw} WHERE {loaded} IS NULL ORDER BY {extracted}, {raw_id} LIMIT {limit})",
            loaded = self.q(LOADED_AT_COLUMN),
            raw_id = self.q(RAW_ID_COLUMN),
            extracted = self.q(EXTRACTED_AT_COLUMN),
            limit = options.batch_size,
        ));

        // A batch that is merged again must not leave the rows of its previous attempt.
        statements.push(format!(
            "DELETE FROM {} WHERE {raw_id} IN (SELECT {raw_id} FROM {raw} WHERE {} = {stamp})",
            self.dialect.table(live),
            self.q(LOADED_AT_COLUMN),
            raw_id = self.q(RAW_ID_COLUMN),
        ));

        let mut source_filter = format!("{} = {stamp}", self.q(LOADED_AT_COLUMN));
        if stream.is_dedup()
            && let Some(cdc) = &stream.cdc_deletion_column
        {
            // Earlier deletions must keep outranking late-arriving older records.
            source_filter = format!(
                "{source_filter} OR ({} IS NOT NULL AND {})",
                self.q(LOADED_AT_COLUMN),
                cast::field_present(&self.dialect, &cdc.original)
            );
        }

        let written_position = statements.len();
        statements.push(self.insert_typed(stream, live, &source_filter, &stamp, options.safer_casting));
        statements.extend(self.dedup_and_delete(stream, live));

        Ok(BatchPlan {
            sql: Sql::transactionally(statements),
            claim_position,
            written_position,
        })
    }

    /// Rows of the final table whose primary key has a more recent row, then
    /// rows carrying a deletion marker.
    fn dedup_and_delete(&self, stream: &StreamConfig, table: &TableRef) -> Vec<String> {
        if !stream.is_dedup() {
            return Vec::new();
        }

        let table_sql = self.dialect.table(table);
        let raw_id = self.q(RAW_ID_COLUMN);
        let mut statements = vec![format!(
            "DELETE FROM {table_sql} WHERE {raw_id} IN (SELECT {raw_id} FROM (SELECT {raw_id}, {} AS {rn} FROM {table_sql}) AS numbered WHERE {rn} <> 1)",
            self.row_number(stream),
            rn = self.q(ROW_NUMBER_COLUMN),
        )];

        if let Some(cdc) = &stream.cdc_deletion_column {
            statements.push(format!(
                "DELETE FROM {table_sql} WHERE {} IS NOT NULL",
                self.q(&cdc.name)
            ));
        }

        statements
    }

    fn row_number(&self, stream: &StreamConfig) -> String {
        let partition = stream
            .primary_key
            .iter()
            .map(|key| self.q(&key.name))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY {} DESC, {} DESC)",
            self.q(EXTRACTED_AT_COLUMN),
            self.q(RAW_ID_COLUMN)
        )
    }

    /// Typed rows of the raw rows matching `source_filter`, written into `target`.
    ///
    /// For dedup streams only the most recent row per primary key is written.
    fn insert_typed(
        &self,
        stream: &StreamConfig,
        target: &TableRef,
        source_filter: &str,
        stamp: &str,
        safer_casting: bool,
    ) -> String {
        let raw_id = self.q(RAW_ID_COLUMN);
        let extracted = self.q(EXTRACTED_AT_COLUMN);
        let meta = self.q(META_COLUMN);

        let mut typed_columns = Vec::with_capacity(stream.columns.len());
        let mut errors = Vec::with_capacity(stream.columns.len());
        for (column, ty) in &stream.columns {
            let field = cast::typed_field(&self.dialect, &column.original, ty, safer_casting);
            typed_columns.push(format!("{} AS {}", field.value, self.q(&column.name)));
            errors.push(field.error);
        }

        let declared: Vec<String> = stream
            .columns
            .iter()
            .map(|(column, _)| self.q(&column.name))
            .collect();

        let mut intermediate_items = typed_columns;
        intermediate_items.push(format!(
            "{} AS {meta}",
            cast::meta_expression(&self.dialect, &errors)
        ));
        intermediate_items.push(raw_id.clone());
        intermediate_items.push(extracted.clone());

        let mut ctes = vec![format!(
            "intermediate_data AS (SELECT {} FROM {} WHERE {source_filter})",
            intermediate_items.join(", "),
            self.dialect.table(&stream.id.raw)
        )];

        let source = if stream.is_dedup() {
            ctes.push(format!(
                "numbered_rows AS (SELECT *, {} AS {} FROM intermediate_data)",
                self.row_number(stream),
                self.q(ROW_NUMBER_COLUMN)
            ));
            format!("numbered_rows WHERE {} = 1", self.q(ROW_NUMBER_COLUMN))
        } else {
            "intermediate_data".to_string()
        };

        let mut insert_columns = vec![
            raw_id.clone(),
            extracted.clone(),
            self.q(LOADED_AT_COLUMN),
            meta.clone(),
        ];
        insert_columns.extend(declared.iter().cloned());

        let mut select_items = vec![raw_id, extracted, stamp.to_string(), meta];
        select_items.extend(declared);

        format!(
            "INSERT INTO {} ({}) WITH {} SELECT {} FROM {source}",
            self.dialect.table(target),
            insert_columns.join(", "),
            ctes.join(", "),
            select_items.join(", ")
        )
    }

    /// Rebuilds the final table in `staging` and swaps it in.
    ///
    /// Pending raw rows are claimed with the stamp only after the swap, so a plan
    /// interrupted earlier leaves them pending for the next pass. The plan is one
    /// transaction where DDL is transactional, a sequence of idempotent steps otherwise.
    pub fn rebuild(
        &self,
        stream: &StreamConfig,
        staging: &StagingTable,
        source: RebuildSource,
        options: &MergeOptions,
    ) -> TndResult<BatchPlan> {
        self.validate(stream)?;

        let stamp = self.dialect.timestamp_literal(options.loaded_at);
        let loaded = self.q(LOADED_AT_COLUMN);

        let mut statements = Vec::new();
        statements.extend(self.safe_cast_prelude(options.safer_casting));
        statements.push(format!(
            "DROP TABLE IF EXISTS {}",
            self.dialect.table(&staging.table)
        ));
        statements.push(self.create_table_statement(stream, &staging.table, false));

        let source_filter = match source {
            RebuildSource::FullHistory => "TRUE".to_string(),
            RebuildSource::CurrentPass => format!("{loaded} IS NULL"),
        };
        let written_position = statements.len();
        statements.push(self.insert_typed(
            stream,
            &staging.table,
            &source_filter,
            &stamp,
            options.safer_casting,
        ));

        if stream.is_dedup()
            && let Some(cdc) = &stream.cdc_deletion_column
        {
            statements.push(format!(
                "DELETE FROM {} WHERE {} IS NOT NULL",
                self.dialect.table(&staging.table),
                self.q(&cdc.name)
            ));
        }

        statements.extend(self.swap_statements(staging));

        let claim_position = statements.len();
        statements.push(format!(
            "UPDATE {} SET {loaded} = {stamp} WHERE {loaded} IS NULL",
            self.dialect.table(&stream.id.raw)
        ));

        Ok(BatchPlan {
            sql: self.ddl_plan(statements),
            claim_position,
            written_position,
        })
    }

    /// Rebuilds the final table from the whole raw history.
    pub fn soft_reset(&self, stream: &StreamConfig, options: &MergeOptions) -> TndResult<BatchPlan> {
        let staging = StagingTable::for_stream(
            &stream.id,
            StagingTable::SOFT_RESET_SUFFIX,
            &self.dialect.naming,
        );
        self.rebuild(stream, &staging, RebuildSource::FullHistory, options)
    }

    fn swap_statements(&self, staging_table: &StagingTable) -> Vec<String> {
        let LiveTable(live_ref) = &staging_table.live;
        let live = self.dialect.table(live_ref);
        let staging = self.dialect.table(&staging_table.table);

        match self.dialect.table_swap {
            TableSwap::DropAndRename => vec![
                format!("DROP TABLE IF EXISTS {live}"),
                format!(
                    "ALTER TABLE {staging} RENAME TO {}",
                    self.q(&live_ref.name)
                ),
            ],
            TableSwap::SwapWith => vec![
                format!("CREATE TABLE IF NOT EXISTS {live} LIKE {staging}"),
                format!("ALTER TABLE {live} SWAP WITH {staging}"),
                format!("DROP TABLE IF EXISTS {staging}"),
            ],
            TableSwap::CreateOrReplaceCopy => vec![
                format!("CREATE OR REPLACE TABLE {live} COPY {staging}"),
                format!("DROP TABLE IF EXISTS {staging}"),
            ],
        }
    }

    /// Replaces the live table with the staging table.
    pub fn overwrite_final_table(&self, staging: &StagingTable) -> Sql {
        self.ddl_plan(self.swap_statements(staging))
    }

    /// Marks every raw row as not yet merged.
    pub fn clear_loaded_at(&self, id: &StreamId) -> Sql {
        Sql::of(format!(
            "UPDATE {} SET {} = NULL WHERE TRUE",
            self.dialect.table(&id.raw),
            self.q(LOADED_AT_COLUMN)
        ))
    }

    /// Copies a previous-generation raw table into the current raw layout.
    ///
    /// The legacy table is left in place.
    pub fn migrate_raw_table_from_legacy_format(&self, id: &StreamId) -> Sql {
        let data = match self.dialect.json {
            JsonSyntax::BigQuery => format!("PARSE_JSON({})", self.q(DATA_COLUMN)),
            JsonSyntax::Postgres | JsonSyntax::Snowflake => {
                format!("CAST({} AS {})", self.q(DATA_COLUMN), self.document_type())
            }
        };

        Sql::of(format!(
            "CREATE TABLE IF NOT EXISTS {} AS SELECT {} AS {}, {} AS {}, CAST(NULL AS {}) AS {}, {data} AS {}, CAST(NULL AS {}) AS {} FROM {}",
            self.dialect.table(&id.raw),
            self.q("_airbyte_ab_id"),
            self.q(RAW_ID_COLUMN),
            self.q("_airbyte_emitted_at"),
            self.q(EXTRACTED_AT_COLUMN),
            self.timestamp_type(),
            self.q(LOADED_AT_COLUMN),
            self.q(DATA_COLUMN),
            self.document_type(),
            self.q(META_COLUMN),
            self.dialect.table(&id.legacy_raw()),
        ))
    }

    pub fn add_column(&self, table: &TableRef, column: &str, ddl: &str) -> Sql {
        Sql::of(format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {ddl}",
            self.dialect.table(table),
            self.q(column)
        ))
    }

    /// `loaded_at` column type, for migrations adding it.
    pub fn loaded_at_type(&self) -> &'static str {
        self.timestamp_type()
    }

    /// Query returning `(column_name, data_type)` rows of `table`.
    pub fn describe_table(&self, table: &TableRef) -> String {
        match self.dialect.json {
            JsonSyntax::BigQuery => format!(
                "SELECT column_name, data_type FROM {}.INFORMATION_SCHEMA.COLUMNS WHERE table_name = {} ORDER BY ordinal_position",
                self.q(&table.namespace),
                self.dialect.literal(&table.name)
            ),
            JsonSyntax::Postgres | JsonSyntax::Snowflake => format!(
                "SELECT column_name, data_type FROM information_schema.columns WHERE table_schema = {} AND table_name = {} ORDER BY ordinal_position",
                self.dialect.literal(&table.namespace),
                self.dialect.literal(&table.name)
            ),
        }
    }

    /// Query returning one row when `table` exists and none otherwise.
    pub fn find_table(&self, table: &TableRef) -> String {
        match self.dialect.json {
            JsonSyntax::BigQuery => format!(
                "SELECT table_name FROM {}.INFORMATION_SCHEMA.TABLES WHERE table_name = {}",
                self.q(&table.namespace),
                self.dialect.literal(&table.name)
            ),
            JsonSyntax::Postgres | JsonSyntax::Snowflake => format!(
                "SELECT table_name FROM information_schema.tables WHERE table_schema = {} AND table_name = {}",
                self.dialect.literal(&table.namespace),
                self.dialect.literal(&table.name)
            ),
        }
    }

    /// Query returning `(min_unloaded_extracted_at, max_extracted_at)`.
    ///
    /// The minimum is moved one second back so that comparisons against it cover
    /// rows extracted within the same second.
    pub fn raw_table_status(&self, id: &StreamId) -> String {
        let raw = self.dialect.table(&id.raw);
        let extracted = self.q(EXTRACTED_AT_COLUMN);
        format!(
            "SELECT (SELECT {} FROM {raw} WHERE {} IS NULL) AS min_unloaded_extracted_at, (SELECT MAX({extracted}) FROM {raw}) AS max_extracted_at",
            self.dialect.minus_one_second(&format!("MIN({extracted})")),
            self.q(LOADED_AT_COLUMN)
        )
    }

    /// Query counting final rows written with `loaded_at` that carry cast errors.
    pub fn count_cast_errors(&self, stream: &StreamConfig, loaded_at: DateTime<Utc>) -> String {
        format!(
            "SELECT COUNT(*) FROM {} WHERE {} = {} AND {}",
            self.dialect.table(&stream.id.final_table),
            self.q(LOADED_AT_COLUMN),
            self.dialect.timestamp_literal(loaded_at),
            cast::has_errors(&self.dialect)
        )
    }
}
