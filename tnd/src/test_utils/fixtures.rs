use config::shared::{EngineConfig, RetryConfig};

use crate::destination::QueryRow;
use crate::naming::{EXTRACTED_AT_COLUMN, LOADED_AT_COLUMN, META_COLUMN, RAW_ID_COLUMN};
use crate::sql::SqlGenerator;
use crate::test_utils::executor::MockExecutor;
use crate::types::{AirbyteType, ColumnId, PrimitiveKind, StreamConfig, StreamId, SyncMode, TableRef};

pub const RAW_NAMESPACE: &str = "airbyte_internal";

/// A stream `public.{name}` with an integer `id`, a string `status` and a CDC
/// deletion column. Dedup streams are keyed by `id`.
pub fn stream(name: &str, sync_mode: SyncMode) -> StreamConfig {
    let id = ColumnId::new("id", "id");
    let status = ColumnId::new("status", "status");
    let deleted = ColumnId::new("_ab_cdc_deleted_at", "_ab_cdc_deleted_at");

    StreamConfig {
        id: StreamId {
            original_namespace: "public".to_string(),
            original_name: name.to_string(),
            raw: TableRef::new(RAW_NAMESPACE, format!("public_raw__stream_{name}")),
            final_table: TableRef::new("public", name),
        },
        sync_mode,
        primary_key: if sync_mode == SyncMode::AppendDedup {
            vec![id.clone()]
        } else {
            Vec::new()
        },
        cdc_deletion_column: Some(deleted.clone()),
        columns: vec![
            (id, AirbyteType::Primitive(PrimitiveKind::Integer)),
            (status, AirbyteType::Primitive(PrimitiveKind::String)),
            (
                deleted,
                AirbyteType::Primitive(PrimitiveKind::TimestampWithTimezone),
            ),
        ],
    }
}

pub fn orders(sync_mode: SyncMode) -> StreamConfig {
    stream("orders", sync_mode)
}

/// Column metadata rows describing a final table that matches `stream`.
pub fn final_table_rows(generator: &SqlGenerator, stream: &StreamConfig) -> Vec<QueryRow> {
    let types = &generator.dialect().types;
    let mut columns = vec![
        (RAW_ID_COLUMN.to_string(), types.raw_id.reported),
        (EXTRACTED_AT_COLUMN.to_string(), types.timestamp_with_timezone.reported),
        (LOADED_AT_COLUMN.to_string(), types.timestamp_with_timezone.reported),
        (META_COLUMN.to_string(), types.document.reported),
    ];
    columns.extend(
        stream
            .columns
            .iter()
            .map(|(column, ty)| (column.name.clone(), generator.dialect().type_for(ty).reported)),
    );

    columns
        .into_iter()
        .map(|(name, data_type)| {
            QueryRow::new(
                ["column_name", "data_type"],
                [Some(name), Some(data_type.to_string())],
            )
        })
        .collect()
}

/// Scripts `executor` so the final table of `stream` exists with `rows` as its
/// columns and the current raw table exists.
pub async fn script_existing_tables(
    executor: &MockExecutor,
    generator: &SqlGenerator,
    stream: &StreamConfig,
    rows: Vec<QueryRow>,
) {
    executor
        .on_query(generator.describe_table(&stream.id.final_table), rows)
        .await;
    executor
        .on_query(
            generator.find_table(&stream.id.raw),
            vec![QueryRow::new(
                ["table_name"],
                [Some(stream.id.raw.name.clone())],
            )],
        )
        .await;
}

/// Scripts the number of raw rows claimed by successive batches of `stream`.
pub async fn script_claims(executor: &MockExecutor, generator: &SqlGenerator, stream: &StreamConfig, counts: impl IntoIterator<Item = u64>) {
    let pattern = format!(
        "UPDATE {} SET",
        generator.dialect().table(&stream.id.raw)
    );
    executor.on_execute(pattern, counts).await;
}

/// Scripts the cast error count returned for every batch of `stream`.
pub async fn script_cast_errors(executor: &MockExecutor, generator: &SqlGenerator, stream: &StreamConfig, count: u64) {
    let pattern = format!(
        "SELECT COUNT(*) FROM {}",
        generator.dialect().table(&stream.id.final_table)
    );
    executor
        .on_query(
            pattern,
            vec![QueryRow::new(["count"], [Some(count.to_string())])],
        )
        .await;
}

/// Scripts the raw table status of `stream`. `pending` says whether unloaded rows exist.
pub async fn script_raw_status(executor: &MockExecutor, generator: &SqlGenerator, stream: &StreamConfig, pending: bool) {
    let min_unloaded = pending.then(|| "2024-01-01 00:00:00+00".to_string());
    executor
        .on_query(
            generator.raw_table_status(&stream.id),
            vec![QueryRow::new(
                ["min_unloaded_extracted_at", "max_extracted_at"],
                [min_unloaded, Some("2024-01-02 00:00:00+00".to_string())],
            )],
        )
        .await;
}

/// Engine settings with fast retries, for tests.
pub fn engine_config(batch_size: u64) -> EngineConfig {
    EngineConfig {
        raw_namespace: RAW_NAMESPACE.to_string(),
        batch_size,
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        statement_timeout_ms: 5_000,
        ..EngineConfig::default()
    }
}
