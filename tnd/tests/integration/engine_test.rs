use telemetry::init_test_tracing;
use tnd::TndEngine;
use tnd::catalog::ParsedCatalog;
use tnd::error::{ErrorCategory, ErrorKind};
use tnd::migration::MigrationRunner;
use tnd::report::{RetryHint, StreamStatus};
use tnd::sql::{Dialect, SqlGenerator};
use tnd::store::{DestinationStateStore, MemoryStateStore};
use tnd::test_utils::fixtures::{engine_config, script_claims, stream};
use tnd::test_utils::{MockExecutor, MockExecutorFactory};
use tnd::types::SyncMode;

fn engine(executor: &MockExecutor, store: &MemoryStateStore, batch_size: u64) -> TndEngine<MockExecutorFactory, MemoryStateStore> {
    TndEngine::new(
        engine_config(batch_size),
        MockExecutorFactory::new(executor.clone()),
        store.clone(),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_stream_does_not_stop_the_others() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let generator = SqlGenerator::new(Dialect::postgres());

    let streams = vec![
        stream("orders", SyncMode::AppendDedup),
        stream("users", SyncMode::Append),
        stream("payments", SyncMode::AppendDedup),
    ];
    script_claims(&executor, &generator, &streams[0], [4]).await;
    script_claims(&executor, &generator, &streams[2], [6]).await;
    executor
        .fail_on(
            "INSERT INTO \"public\".\"users\"",
            ErrorKind::PermissionDenied,
            1,
        )
        .await;

    let engine = engine(&executor, &store, 100);
    let report = engine
        .run(ParsedCatalog {
            streams: streams.clone(),
            rejected: Vec::new(),
        })
        .await;

    let names: Vec<&str> = report.streams.iter().map(|s| s.stream.as_str()).collect();
    assert_eq!(names, ["public.orders", "public.users", "public.payments"]);
    assert_eq!(report.rows_merged(), 10);
    assert_eq!(report.failed_streams().count(), 1);

    let users = report.stream("public.users").unwrap();
    assert_eq!(users.status, StreamStatus::Failed);
    let failure = users.failure.as_ref().unwrap();
    assert_eq!(failure.category, ErrorCategory::Configuration);
    assert_eq!(failure.retry, RetryHint::DoNotRetry);

    // Only the succeeding streams persisted a state.
    assert!(!store.get_state(&streams[0].id).await.unwrap().is_new());
    assert!(store.get_state(&streams[1].id).await.unwrap().is_new());
    assert!(!store.get_state(&streams[2].id).await.unwrap().is_new());
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_streams_are_reported_without_touching_the_destination() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let engine = engine(&executor, &store, 100);

    let catalog = engine
        .catalog_parser()
        .parse_str(
            r#"{
                "streams": [
                    {
                        "namespace": "public",
                        "name": "orders",
                        "json_schema": {"type": "object", "properties": {"id": {"type": "integer"}}},
                        "primary_key": [["id"]],
                        "sync_mode": "append_dedup"
                    },
                    {
                        "namespace": "public",
                        "name": "nested",
                        "json_schema": {"type": "object", "properties": {"a": {"type": "object"}}},
                        "primary_key": [["a", "b"]],
                        "sync_mode": "append_dedup"
                    }
                ]
            }"#,
        )
        .unwrap();
    assert_eq!(catalog.rejected.len(), 1);

    let report = engine.run(catalog).await;

    assert_eq!(report.streams.len(), 2);
    assert_eq!(report.streams[0].status, StreamStatus::Succeeded);

    let nested = report.stream("public.nested").unwrap();
    assert!(nested.is_failed());
    assert_eq!(
        nested.failure.as_ref().unwrap().category,
        ErrorCategory::Configuration
    );
    assert!(
        executor
            .statements()
            .await
            .iter()
            .all(|statement| !statement.contains("nested"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn every_declaration_of_a_repeated_stream_is_reported() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let engine = engine(&executor, &store, 100);

    let catalog = engine
        .catalog_parser()
        .parse_str(
            r#"{
                "streams": [
                    {
                        "name": "users",
                        "json_schema": {"type": "object", "properties": {"id": {"type": "integer"}}},
                        "sync_mode": "append"
                    },
                    {
                        "namespace": "public",
                        "name": "orders",
                        "json_schema": {"type": "object", "properties": {"id": {"type": "integer"}}},
                        "sync_mode": "append"
                    },
                    {
                        "namespace": "public",
                        "name": "users",
                        "json_schema": {"type": "object", "properties": {"id": {"type": "string"}}},
                        "primary_key": [["id"]],
                        "sync_mode": "append_dedup"
                    }
                ]
            }"#,
        )
        .unwrap();

    let report = engine.run(catalog).await;

    assert_eq!(report.streams.len(), 3);
    let names: Vec<&str> = report.streams.iter().map(|s| s.stream.as_str()).collect();
    assert_eq!(names, ["public.orders", "public.users", "public.users"]);
    assert_eq!(report.streams[0].status, StreamStatus::Succeeded);
    for users in &report.streams[1..] {
        let failure = users.failure.as_ref().unwrap();
        assert_eq!(failure.category, ErrorCategory::Configuration);
        assert_eq!(failure.retry, RetryHint::DoNotRetry);
        assert!(failure.reason.contains("declared more than once"));
    }
    assert!(
        executor
            .statements()
            .await
            .iter()
            .all(|statement| !statement.contains("users"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_failures_fail_every_stream() {
    init_test_tracing();
    let executor = MockExecutor::new();
    executor
        .fail_connect(ErrorKind::DestinationConnectionFailed)
        .await;
    let store = MemoryStateStore::new();

    let report = engine(&executor, &store, 100)
        .run(ParsedCatalog {
            streams: vec![
                stream("orders", SyncMode::Append),
                stream("users", SyncMode::Append),
            ],
            rejected: Vec::new(),
        })
        .await;

    assert_eq!(report.failed_streams().count(), 2);
    for stream in &report.streams {
        assert_eq!(stream.failure.as_ref().unwrap().retry, RetryHint::Retry);
    }
    assert_eq!(executor.attempts().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_cancels_pending_streams() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let engine = engine(&executor, &store, 100);

    engine.shutdown_tx().shutdown().unwrap();
    let report = engine
        .run(ParsedCatalog {
            streams: vec![stream("orders", SyncMode::Append)],
            rejected: Vec::new(),
        })
        .await;

    let orders = report.stream("public.orders").unwrap();
    assert!(orders.is_failed());
    assert!(orders.failure.as_ref().unwrap().reason.contains("cancelled"));
    assert_eq!(store.len().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn custom_migrations_decide_the_stored_version() {
    init_test_tracing();
    let executor = MockExecutor::new();
    let store = MemoryStateStore::new();
    let orders = stream("orders", SyncMode::Append);

    let report = engine(&executor, &store, 100)
        .with_migrations(MigrationRunner::new(Vec::new()).unwrap())
        .run(ParsedCatalog {
            streams: vec![orders.clone()],
            rejected: Vec::new(),
        })
        .await;

    assert!(!report.has_failures(), "{report:?}");
    let stored = store.get_state(&orders.id).await.unwrap();
    assert_eq!(stored.state.version, 0);
    assert_eq!(stored.revision, 1);
}

#[test]
fn invalid_engine_config_is_rejected() {
    let config = config::shared::EngineConfig {
        batch_size: 0,
        ..engine_config(1)
    };

    let err = TndEngine::new(
        config,
        MockExecutorFactory::default(),
        MemoryStateStore::new(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);
}
