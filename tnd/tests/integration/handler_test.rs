use std::sync::Arc;

use telemetry::init_test_tracing;
use tnd::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use tnd::destination::{DestinationHandler, HandlerPhase, HandlerSettings, RetryPolicy};
use tnd::error::ErrorKind;
use tnd::migration::MigrationRunner;
use tnd::naming::META_COLUMN;
use tnd::sql::{Dialect, SqlGenerator};
use tnd::store::{DestinationStateStore, MemoryStateStore};
use tnd::test_utils::MockExecutor;
use tnd::test_utils::fixtures::{
    engine_config, final_table_rows, orders, script_cast_errors, script_claims,
    script_existing_tables, script_raw_status,
};
use tnd::types::{DestinationState, StreamConfig, SyncMode};

fn generator() -> SqlGenerator {
    SqlGenerator::new(Dialect::postgres())
}

fn settings(batch_size: u64) -> HandlerSettings {
    let config = engine_config(batch_size);

    HandlerSettings {
        generator: generator(),
        migrations: Arc::new(MigrationRunner::standard()),
        retry: RetryPolicy::from_engine_config(&config),
        batch_size,
        reprocess_raw: false,
    }
}

fn handler(
    executor: &MockExecutor,
    store: &MemoryStateStore,
    settings: HandlerSettings,
) -> (DestinationHandler<MockExecutor, MemoryStateStore>, ShutdownTx) {
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let handler = DestinationHandler::new(executor.clone(), store.clone(), settings, shutdown_rx);

    (handler, shutdown_tx)
}

/// Seeds a fully migrated state and a final table matching `stream`.
async fn existing_stream(executor: &MockExecutor, store: &MemoryStateStore, stream: &StreamConfig, state: DestinationState) {
    let generator = generator();
    script_existing_tables(executor, &generator, stream, final_table_rows(&generator, stream)).await;
    store.insert(&stream.id, state).await;
}

fn migrated() -> DestinationState {
    DestinationState {
        version: MigrationRunner::standard().latest_version(),
        needs_soft_reset: false,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn new_stream_gets_tables_and_a_migrated_state() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let stream = orders(SyncMode::AppendDedup);
    script_claims(&executor, &generator(), &stream, [5]).await;

    let (mut handler, _shutdown_tx) = handler(&executor, &store, settings(10));
    let outcome = handler.run(&stream).await.unwrap();

    assert_eq!(outcome.rows_merged, 5);
    assert!(!outcome.soft_reset);
    assert_eq!(handler.phase(), HandlerPhase::Done);

    let statements = executor.statements().await;
    assert!(statements[0].starts_with("CREATE SCHEMA IF NOT EXISTS \"airbyte_internal\""));
    assert!(statements[1].starts_with("CREATE SCHEMA IF NOT EXISTS \"public\""));
    assert_eq!(
        executor
            .statements_containing("CREATE TABLE IF NOT EXISTS \"public\".\"orders\"")
            .await
            .len(),
        1
    );
    assert_eq!(executor.statements_containing("INSERT INTO \"public\".\"orders\"").await.len(), 1);

    let stored = store.get_state(&stream.id).await.unwrap();
    assert_eq!(stored.state, migrated());
    assert_eq!(stored.revision, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn incremental_merge_runs_batches_until_one_is_short() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let stream = orders(SyncMode::Append);
    existing_stream(&executor, &store, &stream, migrated()).await;
    script_claims(&executor, &generator(), &stream, [2, 2, 1]).await;
    script_cast_errors(&executor, &generator(), &stream, 1).await;

    let (mut handler, _shutdown_tx) = handler(&executor, &store, settings(2));
    let outcome = handler.run(&stream).await.unwrap();

    assert_eq!(outcome.rows_merged, 5);
    assert_eq!(outcome.cast_errors, 3);
    assert_eq!(
        executor.statements_containing("INSERT INTO \"public\".\"orders\"").await.len(),
        3
    );
    // Nothing changed, so the stored state keeps its revision.
    assert_eq!(store.get_state(&stream.id).await.unwrap().revision, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_without_pending_rows_changes_nothing_but_the_claim() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let stream = orders(SyncMode::AppendDedup);
    existing_stream(&executor, &store, &stream, migrated()).await;

    let (mut handler, _shutdown_tx) = handler(&executor, &store, settings(100));
    let outcome = handler.run(&stream).await.unwrap();

    assert_eq!(outcome.rows_merged, 0);
    assert_eq!(outcome.cast_errors, 0);
    // The cast error count is skipped for empty batches.
    assert!(
        executor
            .queries()
            .await
            .iter()
            .all(|query| !query.starts_with("SELECT COUNT(*)"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn schema_drift_triggers_a_soft_reset() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let stream = orders(SyncMode::AppendDedup);

    let generator = generator();
    let rows = final_table_rows(&generator, &stream)
        .into_iter()
        .filter(|row| row.get("column_name") != Some("status"))
        .collect();
    script_existing_tables(&executor, &generator, &stream, rows).await;
    store.insert(&stream.id, migrated()).await;
    script_claims(&executor, &generator, &stream, [2]).await;
    executor
        .on_execute("INSERT INTO \"public\".\"orders_ab_soft_reset\"", [7])
        .await;

    let (mut handler, _shutdown_tx) = handler(&executor, &store, settings(100));
    let outcome = handler.run(&stream).await.unwrap();

    // Rows rebuilt from the whole history, not only the two claimed now.
    assert!(outcome.soft_reset);
    assert_eq!(outcome.rows_merged, 7);

    let rebuild = executor
        .committed()
        .await
        .into_iter()
        .find(|transaction| {
            transaction
                .iter()
                .any(|statement| statement.contains("orders_ab_soft_reset"))
        })
        .expect("soft reset transaction");
    assert_eq!(
        rebuild[rebuild.len() - 2],
        "ALTER TABLE \"public\".\"orders_ab_soft_reset\" RENAME TO \"orders\""
    );
    assert!(rebuild.last().unwrap().starts_with("UPDATE \"airbyte_internal\".\"public_raw__stream_orders\" SET"));
    assert!(
        executor
            .statements_containing("INSERT INTO \"public\".\"orders\"")
            .await
            .is_empty()
    );

    let stored = store.get_state(&stream.id).await.unwrap();
    assert!(!stored.state.needs_soft_reset);
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_soft_reset_is_honored_and_cleared() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let stream = orders(SyncMode::Append);
    existing_stream(&executor, &store, &stream, migrated().with_soft_reset(true)).await;

    let (mut handler, _shutdown_tx) = handler(&executor, &store, settings(100));
    let outcome = handler.run(&stream).await.unwrap();

    assert!(outcome.soft_reset);
    let stored = store.get_state(&stream.id).await.unwrap();
    assert_eq!(stored.state, migrated());
    assert_eq!(stored.revision, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn conversion_failure_retries_with_safer_casts() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let stream = orders(SyncMode::AppendDedup);
    existing_stream(&executor, &store, &stream, migrated()).await;
    script_claims(&executor, &generator(), &stream, [3]).await;
    script_cast_errors(&executor, &generator(), &stream, 1).await;
    executor
        .fail_on(
            "CAST((\"_airbyte_data\" ->> 'id') AS bigint)",
            ErrorKind::DataConversion,
            1,
        )
        .await;

    let (mut handler, _shutdown_tx) = handler(&executor, &store, settings(100));
    let outcome = handler.run(&stream).await.unwrap();

    assert_eq!(outcome.rows_merged, 3);
    assert_eq!(outcome.cast_errors, 1);

    let merge = executor
        .committed()
        .await
        .into_iter()
        .find(|transaction| transaction.iter().any(|statement| statement.contains("INSERT INTO")))
        .unwrap();
    assert!(merge[0].starts_with("CREATE OR REPLACE FUNCTION pg_temp._airbyte_safe_cast"));
    assert!(merge.iter().any(|statement| statement.contains(META_COLUMN)));
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_are_retried_locally() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let stream = orders(SyncMode::Append);
    existing_stream(&executor, &store, &stream, migrated()).await;
    script_claims(&executor, &generator(), &stream, [1]).await;
    executor
        .fail_on("INSERT INTO", ErrorKind::DestinationConnectionFailed, 2)
        .await;

    let (mut handler, _shutdown_tx) = handler(&executor, &store, settings(100));
    let outcome = handler.run(&stream).await.unwrap();

    assert_eq!(outcome.rows_merged, 1);
    assert_eq!(executor.statements_containing("INSERT INTO").await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_merge_leaves_the_state_untouched() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let stream = orders(SyncMode::AppendDedup);
    existing_stream(&executor, &store, &stream, migrated().with_soft_reset(true)).await;
    executor
        .fail_on("orders_ab_soft_reset", ErrorKind::PermissionDenied, 1)
        .await;

    let (mut handler, _shutdown_tx) = handler(&executor, &store, settings(100));
    let err = handler.run(&stream).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(handler.phase(), HandlerPhase::Failed);

    let stored = store.get_state(&stream.id).await.unwrap();
    assert!(stored.state.needs_soft_reset);
    assert_eq!(stored.revision, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn overwrite_without_new_rows_keeps_the_final_table() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let stream = orders(SyncMode::Overwrite);
    existing_stream(&executor, &store, &stream, migrated()).await;
    script_raw_status(&executor, &generator(), &stream, false).await;

    let (mut handler, _shutdown_tx) = handler(&executor, &store, settings(100));
    let outcome = handler.run(&stream).await.unwrap();

    assert!(!outcome.soft_reset);
    assert!(executor.statements_containing("_airbyte_tmp").await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn overwrite_rebuilds_from_the_current_pass_and_swaps() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let stream = orders(SyncMode::Overwrite);
    existing_stream(&executor, &store, &stream, migrated()).await;
    script_raw_status(&executor, &generator(), &stream, true).await;
    script_claims(&executor, &generator(), &stream, [4]).await;
    executor
        .on_execute("INSERT INTO \"public\".\"orders_airbyte_tmp\"", [4])
        .await;

    let (mut handler, _shutdown_tx) = handler(&executor, &store, settings(100));
    let outcome = handler.run(&stream).await.unwrap();

    assert!(outcome.soft_reset);
    assert_eq!(outcome.rows_merged, 4);

    let statements = executor.statements().await;
    let insert = statements
        .iter()
        .position(|statement| statement.starts_with("INSERT INTO \"public\".\"orders_airbyte_tmp\""))
        .unwrap();
    assert!(statements[insert].contains("WHERE \"_airbyte_loaded_at\" IS NULL)"));
    let rename = statements
        .iter()
        .position(|statement| statement == "ALTER TABLE \"public\".\"orders_airbyte_tmp\" RENAME TO \"orders\"")
        .unwrap();
    let claim = statements
        .iter()
        .position(|statement| statement.starts_with("UPDATE \"airbyte_internal\".\"public_raw__stream_orders\" SET"))
        .unwrap();
    assert!(insert < rename && rename < claim);
}

#[tokio::test(flavor = "multi_thread")]
async fn overwrite_of_a_maximal_name_stages_in_a_distinct_table() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let mut stream = orders(SyncMode::Overwrite);
    let long_name = "o".repeat(63);
    stream.id.final_table.name = long_name.clone();
    existing_stream(&executor, &store, &stream, migrated()).await;
    script_raw_status(&executor, &generator(), &stream, true).await;

    let (mut handler, _shutdown_tx) = handler(&executor, &store, settings(100));
    handler.run(&stream).await.unwrap();

    let statements = executor.statements().await;
    let rename = statements
        .iter()
        .find(|statement| statement.starts_with("ALTER TABLE"))
        .unwrap();
    let staging = rename
        .strip_prefix("ALTER TABLE \"public\".\"")
        .and_then(|rest| rest.split('"').next())
        .unwrap();
    assert_eq!(staging.len(), 63);
    assert_ne!(staging, long_name);
    assert!(staging.ends_with("_airbyte_tmp"));
    assert!(rename.ends_with(&format!("RENAME TO \"{long_name}\"")));
}

#[tokio::test(flavor = "multi_thread")]
async fn legacy_raw_table_is_copied_then_rebuilt() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let stream = orders(SyncMode::AppendDedup);
    let generator = generator();
    executor
        .on_query(
            generator.find_table(&stream.id.legacy_raw()),
            vec![tnd::destination::QueryRow::new(
                ["table_name"],
                [Some("_airbyte_raw_orders".to_string())],
            )],
        )
        .await;

    let (mut handler, _shutdown_tx) = handler(&executor, &store, settings(100));
    let outcome = handler.run(&stream).await.unwrap();

    assert!(outcome.soft_reset);
    let statements = executor.statements().await;
    let copy = statements
        .iter()
        .position(|statement| statement.contains("FROM \"public\".\"_airbyte_raw_orders\""))
        .unwrap();
    let rebuild = statements
        .iter()
        .position(|statement| statement.contains("orders_ab_soft_reset"))
        .unwrap();
    assert!(copy < rebuild);

    assert_eq!(store.get_state(&stream.id).await.unwrap().state, migrated());
}

#[tokio::test(flavor = "multi_thread")]
async fn reprocessing_clears_loaded_at_first() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let stream = orders(SyncMode::Append);
    existing_stream(&executor, &store, &stream, migrated()).await;

    let settings = HandlerSettings {
        reprocess_raw: true,
        ..settings(100)
    };
    let (mut handler, _shutdown_tx) = handler(&executor, &store, settings);
    handler.run(&stream).await.unwrap();

    let statements = executor.statements().await;
    let clear = statements
        .iter()
        .position(|statement| statement.ends_with("= NULL WHERE TRUE"))
        .unwrap();
    let insert = statements
        .iter()
        .position(|statement| statement.starts_with("INSERT INTO"))
        .unwrap();
    assert!(clear < insert);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_before_start_cancels_without_statements() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let stream = orders(SyncMode::Append);

    let (mut handler, shutdown_tx) = handler(&executor, &store, settings(100));
    shutdown_tx.shutdown().unwrap();
    let err = handler.run(&stream).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(executor.attempts().await, 0);
    assert_eq!(store.len().await, 0);
}
