//! Reads of destination catalog information needed before a merge.

use crate::destination::executor::SqlExecutor;
use crate::error::{ErrorKind, TndResult};
use crate::sql::{RawTableStatus, SqlGenerator};
use crate::tnd_error;
use crate::types::{ColumnDefinition, ExistingTables, StreamId, TableDefinition, TableRef};

/// Column metadata of `table`, or `None` when it does not exist.
pub async fn describe_table<E>(
    executor: &E,
    generator: &SqlGenerator,
    table: &TableRef,
) -> TndResult<Option<TableDefinition>>
where
    E: SqlExecutor,
{
    let rows = executor.query(&generator.describe_table(table)).await?;
    if rows.is_empty() {
        return Ok(None);
    }

    let columns = rows
        .iter()
        .map(|row| match (row.get_at(0), row.get_at(1)) {
            (Some(name), Some(data_type)) => Ok(ColumnDefinition::new(name, data_type)),
            _ => Err(tnd_error!(
                ErrorKind::DestinationQueryFailed,
                "Column metadata row is incomplete",
                format!("table {table}")
            )),
        })
        .collect::<TndResult<Vec<_>>>()?;

    Ok(Some(TableDefinition { columns }))
}

pub async fn table_exists<E>(executor: &E, generator: &SqlGenerator, table: &TableRef) -> TndResult<bool>
where
    E: SqlExecutor,
{
    let rows = executor.query(&generator.find_table(table)).await?;

    Ok(!rows.is_empty())
}

/// Final table columns and the presence of the raw tables of `id`.
pub async fn fetch_existing_tables<E>(
    executor: &E,
    generator: &SqlGenerator,
    id: &StreamId,
) -> TndResult<ExistingTables>
where
    E: SqlExecutor,
{
    Ok(ExistingTables {
        final_table: describe_table(executor, generator, &id.final_table).await?,
        raw_table_exists: table_exists(executor, generator, &id.raw).await?,
        legacy_raw_table_exists: table_exists(executor, generator, &id.legacy_raw()).await?,
    })
}

pub async fn fetch_raw_table_status<E>(
    executor: &E,
    generator: &SqlGenerator,
    id: &StreamId,
) -> TndResult<RawTableStatus>
where
    E: SqlExecutor,
{
    let rows = executor.query(&generator.raw_table_status(id)).await?;
    let Some(row) = rows.first() else {
        return Ok(RawTableStatus::default());
    };

    Ok(RawTableStatus {
        min_unloaded_extracted_at: row.get_at(0).map(str::to_string),
        max_extracted_at: row.get_at(1).map(str::to_string),
    })
}

/// Parses the single count returned by an aggregate query.
pub(crate) fn parse_count(rows: &[crate::destination::QueryRow]) -> TndResult<u64> {
    let value = rows.first().and_then(|row| row.get_at(0)).unwrap_or("0");

    value.trim().parse::<u64>().map_err(|_| {
        tnd_error!(
            ErrorKind::DestinationQueryFailed,
            "Count query returned a non-numeric value",
            value.to_string()
        )
    })
}
