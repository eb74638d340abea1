use std::sync::Arc;

use telemetry::init_test_tracing;
use tnd::concurrency::shutdown::create_shutdown_channel;
use tnd::destination::{DestinationHandler, HandlerSettings, RetryPolicy};
use tnd::error::ErrorKind;
use tnd::failpoints::{
    HANDLER_AFTER_MERGE_BEFORE_STATE_PERSIST, HANDLER_BEFORE_MERGE_BATCH,
    HANDLER_BETWEEN_PLAN_TRANSACTIONS,
};
use tnd::migration::MigrationRunner;
use tnd::sql::{Dialect, SqlGenerator};
use tnd::store::{DestinationStateStore, MemoryStateStore};
use tnd::test_utils::MockExecutor;
use tnd::test_utils::failpoints::CustomFailScenario;
use tnd::test_utils::fixtures::{
    engine_config, final_table_rows, orders, script_existing_tables, script_raw_status,
};
use tnd::types::{DestinationState, SyncMode};

fn settings() -> HandlerSettings {
    settings_for(Dialect::postgres())
}

fn settings_for(dialect: Dialect) -> HandlerSettings {
    HandlerSettings {
        generator: SqlGenerator::new(dialect),
        migrations: Arc::new(MigrationRunner::standard()),
        retry: RetryPolicy::from_engine_config(&engine_config(100)),
        batch_size: 100,
        reprocess_raw: false,
    }
}

async fn run_once(executor: &MockExecutor, store: &MemoryStateStore) -> tnd::error::TndResult<()> {
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let mut handler = DestinationHandler::new(executor.clone(), store.clone(), settings(), shutdown_rx);

    handler.run(&orders(SyncMode::AppendDedup)).await.map(|_| ())
}

async fn pending_soft_reset(executor: &MockExecutor, store: &MemoryStateStore) {
    let generator = SqlGenerator::new(Dialect::postgres());
    let stream = orders(SyncMode::AppendDedup);
    script_existing_tables(executor, &generator, &stream, final_table_rows(&generator, &stream)).await;
    store
        .insert(
            &stream.id,
            DestinationState {
                version: MigrationRunner::standard().latest_version(),
                needs_soft_reset: true,
            },
        )
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_before_state_persist_repeats_the_soft_reset() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    pending_soft_reset(&executor, &store).await;
    let id = orders(SyncMode::AppendDedup).id;

    {
        let _scenario =
            CustomFailScenario::setup(&[(HANDLER_AFTER_MERGE_BEFORE_STATE_PERSIST, "return(fatal)")]);

        let err = run_once(&executor, &store).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WithFatalFailure);
    }

    // The rebuild committed but the stored state still asks for it.
    assert_eq!(executor.statements_containing("RENAME TO").await.len(), 1);
    assert!(store.get_state(&id).await.unwrap().state.needs_soft_reset);

    run_once(&executor, &store).await.unwrap();

    assert_eq!(executor.statements_containing("RENAME TO").await.len(), 2);
    let stored = store.get_state(&id).await.unwrap();
    assert!(!stored.state.needs_soft_reset);
    assert_eq!(stored.revision, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_before_a_batch_merges_nothing() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let generator = SqlGenerator::new(Dialect::postgres());
    let stream = orders(SyncMode::AppendDedup);
    script_existing_tables(&executor, &generator, &stream, final_table_rows(&generator, &stream)).await;

    let _scenario = CustomFailScenario::setup(&[(HANDLER_BEFORE_MERGE_BATCH, "return(transient)")]);

    let err = run_once(&executor, &store).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WithTransientFailure);
    assert!(executor.statements_containing("INSERT INTO").await.is_empty());
    assert_eq!(store.len().await, 0);
}

async fn run_overwrite(executor: &MockExecutor, store: &MemoryStateStore) -> tnd::error::TndResult<()> {
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let mut handler = DestinationHandler::new(
        executor.clone(),
        store.clone(),
        settings_for(Dialect::snowflake()),
        shutdown_rx,
    );

    handler.run(&orders(SyncMode::Overwrite)).await.map(|_| ())
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_overwrite_leaves_rows_pending_until_the_swap() {
    init_test_tracing();
    let generator = SqlGenerator::new(Dialect::snowflake());
    let stream = orders(SyncMode::Overwrite);
    let claim = format!("UPDATE {} SET", generator.dialect().table(&stream.id.raw));
    let position = |statements: &[String], pattern: &str| {
        statements
            .iter()
            .rposition(|statement| statement.contains(pattern))
    };

    let mut stopped_between_swap_and_claim = false;
    for skipped in 0..50 {
        let executor = MockExecutor::new();
        let store = MemoryStateStore::new();
        script_existing_tables(&executor, &generator, &stream, final_table_rows(&generator, &stream)).await;
        script_raw_status(&executor, &generator, &stream, true).await;
        store
            .insert(
                &stream.id,
                DestinationState {
                    version: MigrationRunner::standard().latest_version(),
                    needs_soft_reset: false,
                },
            )
            .await;

        let result = {
            let action = match skipped {
                0 => "return(fatal)".to_string(),
                n => format!("{n}*off->return(fatal)"),
            };
            let _scenario = CustomFailScenario::setup(&[(HANDLER_BETWEEN_PLAN_TRANSACTIONS, action.as_str())]);
            run_overwrite(&executor, &store).await
        };
        if result.is_ok() {
            break;
        }
        assert_eq!(result.unwrap_err().kind(), ErrorKind::WithFatalFailure);

        // Raw rows are only stamped once the rebuilt table is live.
        let statements = executor.statements().await;
        let swap = position(&statements, "SWAP WITH");
        match position(&statements, &claim) {
            Some(claimed) => assert!(swap.is_some_and(|swap| swap < claimed)),
            None => stopped_between_swap_and_claim |= swap.is_some(),
        }

        run_overwrite(&executor, &store).await.unwrap();
        let statements = executor.statements().await;
        let swap = position(&statements, "SWAP WITH").unwrap();
        let claimed = position(&statements, &claim).unwrap();
        assert!(swap < claimed);
    }

    assert!(stopped_between_swap_and_claim);
}
