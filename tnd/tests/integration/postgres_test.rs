use std::time::Duration;

use config::shared::PgConnectionConfig;
use postgres::migrations::apply_state_store_migrations;
use postgres::test_utils::{create_pg_database, drop_pg_database, local_pg_connection_config};
use sqlx::PgPool;
use telemetry::init_test_tracing;
use tnd::TndEngine;
use tnd::catalog::ParsedCatalog;
use tnd::destination::{PgExecutor, PgExecutorFactory, SqlExecutor};
use tnd::error::{ErrorCategory, ErrorKind};
use tnd::migration::MigrationRunner;
use tnd::sql::{Dialect, Sql, SqlGenerator};
use tnd::store::{DestinationStateStore, PostgresStateStore};
use tnd::test_utils::fixtures::{RAW_NAMESPACE, engine_config, stream};
use tnd::types::{DestinationState, StreamConfig, SyncMode};

type PgEngine = TndEngine<PgExecutorFactory, PostgresStateStore>;

/// A fresh database with the state store migrated, or `None` when no test
/// database is configured.
async fn database() -> Option<(PgConnectionConfig, PgPool)> {
    let Some(config) = local_pg_connection_config() else {
        eprintln!("skipping: TESTS_DATABASE_HOST is not set");
        return None;
    };
    let pool = create_pg_database(&config).await;
    apply_state_store_migrations(&config).await.unwrap();

    Some((config, pool))
}

fn pg_engine(config: &PgConnectionConfig, pool: &PgPool, batch_size: u64) -> PgEngine {
    TndEngine::new(
        engine_config(batch_size),
        PgExecutorFactory::new(config.clone(), Duration::from_secs(30)),
        PostgresStateStore::with_pool(pool.clone()),
    )
    .unwrap()
}

fn only(stream: &StreamConfig) -> ParsedCatalog {
    ParsedCatalog {
        streams: vec![stream.clone()],
        rejected: Vec::new(),
    }
}

/// `(id, status, raw_id)` of every final row, ordered by id.
async fn final_rows(pool: &PgPool, stream: &StreamConfig) -> Vec<(Option<i64>, Option<String>, String)> {
    sqlx::query_as(&format!(
        r#"select "id", "status", "_airbyte_raw_id" from "{}"."{}" order by "id", "_airbyte_raw_id""#,
        stream.id.final_table.namespace, stream.id.final_table.name
    ))
    .fetch_all(pool)
    .await
    .unwrap()
}

async fn unloaded_raw_rows(pool: &PgPool, stream: &StreamConfig) -> i64 {
    sqlx::query_scalar(&format!(
        r#"select count(*) from "{}"."{}" where "_airbyte_loaded_at" is null"#,
        stream.id.raw.namespace, stream.id.raw.name
    ))
    .fetch_one(pool)
    .await
    .unwrap()
}

fn row(id: i64, status: &str, raw_id: &str) -> (Option<i64>, Option<String>, String) {
    (Some(id), Some(status.to_string()), raw_id.to_string())
}

async fn execute(pool: &PgPool, sql: Sql) {
    for statement in sql.statements() {
        sqlx::query(statement).execute(pool).await.unwrap();
    }
}

async fn create_raw_table(pool: &PgPool, stream: &StreamConfig) {
    let generator = SqlGenerator::new(Dialect::postgres());
    execute(pool, generator.create_schema(RAW_NAMESPACE)).await;
    execute(pool, generator.create_raw_table(&stream.id)).await;
}

async fn insert_raw(pool: &PgPool, stream: &StreamConfig, rows: &[(&str, &str, &str)]) {
    for (raw_id, extracted_at, data) in rows {
        sqlx::query(&format!(
            r#"insert into "{}"."{}" ("_airbyte_raw_id", "_airbyte_extracted_at", "_airbyte_data") values ($1, $2::timestamptz, $3::jsonb)"#,
            stream.id.raw.namespace, stream.id.raw.name
        ))
        .bind(*raw_id)
        .bind(*extracted_at)
        .bind(*data)
        .execute(pool)
        .await
        .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn dedup_and_cast_failures_against_postgres() {
    init_test_tracing();
    let Some((config, pool)) = database().await else {
        return;
    };

    let orders = stream("orders", SyncMode::AppendDedup);
    let events = stream("events", SyncMode::Append);
    create_raw_table(&pool, &orders).await;
    create_raw_table(&pool, &events).await;
    insert_raw(
        &pool,
        &orders,
        &[
            ("r1", "2024-01-01T00:00:00Z", r#"{"id": 1, "status": "new"}"#),
            ("r2", "2024-01-02T00:00:00Z", r#"{"id": 1, "status": "shipped"}"#),
            ("r3", "2024-01-01T00:00:00Z", r#"{"id": 2, "status": "new"}"#),
            (
                "r4",
                "2024-01-03T00:00:00Z",
                r#"{"id": 2, "status": "gone", "_ab_cdc_deleted_at": "2024-01-03T00:00:00Z"}"#,
            ),
        ],
    )
    .await;
    insert_raw(
        &pool,
        &events,
        &[
            ("e1", "2024-01-01T00:00:00Z", r#"{"id": "not-a-number", "status": "a"}"#),
            ("e2", "2024-01-01T00:00:01Z", r#"{"id": 5, "status": "b"}"#),
        ],
    )
    .await;

    let engine = pg_engine(&config, &pool, 100);
    let catalog = || ParsedCatalog {
        streams: vec![orders.clone(), events.clone()],
        rejected: Vec::new(),
    };

    let report = engine.run(catalog()).await;
    assert!(!report.has_failures(), "{report:?}");
    assert_eq!(report.stream("public.orders").unwrap().rows_merged, 4);
    assert_eq!(report.stream("public.events").unwrap().cast_errors, 1);

    let order_rows: Vec<(Option<i64>, Option<String>)> =
        sqlx::query_as(r#"select "id", "status" from "public"."orders" order by "id""#)
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(order_rows, vec![(Some(1), Some("shipped".to_string()))]);

    let event_rows: Vec<(Option<i64>, String, String)> = sqlx::query_as(
        r#"select "id", "status", "_airbyte_meta"::text from "public"."events" order by "status""#,
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(event_rows.len(), 2);
    assert_eq!(event_rows[0].0, None);
    assert!(event_rows[0].2.contains("DESTINATION_TYPECAST_ERROR"));
    assert_eq!(event_rows[1].0, Some(5));
    assert!(!event_rows[1].2.contains("DESTINATION_TYPECAST_ERROR"));

    // A second pass without new raw rows changes nothing.
    let report = engine.run(catalog()).await;
    assert!(!report.has_failures(), "{report:?}");
    assert_eq!(report.rows_merged(), 0);
    let again: Vec<(Option<i64>, Option<String>)> =
        sqlx::query_as(r#"select "id", "status" from "public"."orders" order by "id""#)
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(again, order_rows);

    pool.close().await;
    drop_pg_database(&config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn postgres_state_store_rejects_stale_writers() {
    init_test_tracing();
    let Some((config, pool)) = database().await else {
        return;
    };

    let store = PostgresStateStore::with_pool(pool.clone());
    let id = stream("orders", SyncMode::Append).id;

    let fresh = store.get_state(&id).await.unwrap();
    assert!(fresh.is_new());

    let state = DestinationState {
        version: 3,
        needs_soft_reset: true,
    };
    let revision = store.set_state(&id, fresh.revision, state).await.unwrap();
    assert_eq!(store.get_state(&id).await.unwrap().state, state);

    let err = store
        .set_state(&id, fresh.revision, DestinationState::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    store
        .set_state(&id, revision, state.with_soft_reset(false))
        .await
        .unwrap();

    pool.close().await;
    drop_pg_database(&config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dedup_and_tombstones_hold_across_single_row_batches() {
    init_test_tracing();
    let Some((config, pool)) = database().await else {
        return;
    };

    let orders = stream("orders", SyncMode::AppendDedup);
    create_raw_table(&pool, &orders).await;
    insert_raw(
        &pool,
        &orders,
        &[
            ("r1", "2024-01-01T00:00:00Z", r#"{"id": 1, "status": "new"}"#),
            ("r2", "2024-01-02T00:00:00Z", r#"{"id": 1, "status": "shipped"}"#),
            ("r3", "2024-01-01T00:00:00Z", r#"{"id": 2, "status": "new"}"#),
            (
                "r4",
                "2024-01-03T00:00:00Z",
                r#"{"id": 2, "status": "gone", "_ab_cdc_deleted_at": "2024-01-03T00:00:00Z"}"#,
            ),
            ("r5", "2024-01-01T00:00:00Z", r#"{"id": 3, "status": "b"}"#),
        ],
    )
    .await;

    let report = pg_engine(&config, &pool, 1).run(only(&orders)).await;
    assert!(!report.has_failures(), "{report:?}");
    assert_eq!(report.rows_merged(), 5);

    assert_eq!(
        final_rows(&pool, &orders).await,
        vec![row(1, "shipped", "r2"), row(3, "b", "r5")]
    );
    assert_eq!(unloaded_raw_rows(&pool, &orders).await, 0);

    pool.close().await;
    drop_pg_database(&config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn late_arrival_older_than_a_deletion_stays_deleted() {
    init_test_tracing();
    let Some((config, pool)) = database().await else {
        return;
    };

    let orders = stream("orders", SyncMode::AppendDedup);
    let engine = pg_engine(&config, &pool, 100);
    create_raw_table(&pool, &orders).await;
    insert_raw(
        &pool,
        &orders,
        &[
            ("r1", "2024-01-01T00:00:00Z", r#"{"id": 2, "status": "new"}"#),
            (
                "r2",
                "2024-01-03T00:00:00Z",
                r#"{"id": 2, "status": "gone", "_ab_cdc_deleted_at": "2024-01-03T00:00:00Z"}"#,
            ),
        ],
    )
    .await;
    assert!(!engine.run(only(&orders)).await.has_failures());
    assert!(final_rows(&pool, &orders).await.is_empty());

    insert_raw(
        &pool,
        &orders,
        &[("r3", "2024-01-02T00:00:00Z", r#"{"id": 2, "status": "late"}"#)],
    )
    .await;
    assert!(!engine.run(only(&orders)).await.has_failures());
    assert!(final_rows(&pool, &orders).await.is_empty());

    insert_raw(
        &pool,
        &orders,
        &[("r4", "2024-01-04T00:00:00Z", r#"{"id": 2, "status": "back"}"#)],
    )
    .await;
    assert!(!engine.run(only(&orders)).await.has_failures());
    assert_eq!(final_rows(&pool, &orders).await, vec![row(2, "back", "r4")]);

    pool.close().await;
    drop_pg_database(&config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn equal_extraction_times_are_decided_by_raw_id() {
    init_test_tracing();
    let Some((config, pool)) = database().await else {
        return;
    };

    let together = stream("together", SyncMode::AppendDedup);
    let apart = stream("apart", SyncMode::AppendDedup);
    let rows = [
        ("r_b", "2024-01-01T00:00:00Z", r#"{"id": 7, "status": "from_b"}"#),
        ("r_a", "2024-01-01T00:00:00Z", r#"{"id": 7, "status": "from_a"}"#),
    ];
    for stream in [&together, &apart] {
        create_raw_table(&pool, stream).await;
        insert_raw(&pool, stream, &rows).await;
    }

    assert!(!pg_engine(&config, &pool, 100).run(only(&together)).await.has_failures());
    assert!(!pg_engine(&config, &pool, 1).run(only(&apart)).await.has_failures());

    for stream in [&together, &apart] {
        assert_eq!(final_rows(&pool, stream).await, vec![row(7, "from_b", "r_b")]);
    }

    pool.close().await;
    drop_pg_database(&config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn soft_reset_rebuilds_what_incremental_merges_produced() {
    init_test_tracing();
    let Some((config, pool)) = database().await else {
        return;
    };

    let orders = stream("orders", SyncMode::AppendDedup);
    let engine = pg_engine(&config, &pool, 2);
    create_raw_table(&pool, &orders).await;
    insert_raw(
        &pool,
        &orders,
        &[
            ("r1", "2024-01-01T00:00:00Z", r#"{"id": 1, "status": "new"}"#),
            ("r2", "2024-01-02T00:00:00Z", r#"{"id": 1, "status": "paid"}"#),
            ("r3", "2024-01-01T00:00:00Z", r#"{"id": 2, "status": "new"}"#),
            (
                "r4",
                "2024-01-02T00:00:00Z",
                r#"{"id": 2, "status": "gone", "_ab_cdc_deleted_at": "2024-01-02T00:00:00Z"}"#,
            ),
        ],
    )
    .await;
    assert!(!engine.run(only(&orders)).await.has_failures());
    insert_raw(
        &pool,
        &orders,
        &[
            ("r5", "2024-01-03T00:00:00Z", r#"{"id": 1, "status": "shipped"}"#),
            ("r6", "2024-01-01T12:00:00Z", r#"{"id": 2, "status": "late"}"#),
            ("r7", "2024-01-03T00:00:00Z", r#"{"id": 3, "status": "new"}"#),
        ],
    )
    .await;
    assert!(!engine.run(only(&orders)).await.has_failures());
    let incremental = final_rows(&pool, &orders).await;
    assert_eq!(incremental, vec![row(1, "shipped", "r5"), row(3, "new", "r7")]);

    let store = PostgresStateStore::with_pool(pool.clone());
    let stored = store.get_state(&orders.id).await.unwrap();
    store
        .set_state(&orders.id, stored.revision, stored.state.with_soft_reset(true))
        .await
        .unwrap();

    let report = engine.run(only(&orders)).await;
    assert!(!report.has_failures(), "{report:?}");
    assert!(report.stream("public.orders").unwrap().soft_reset);
    assert_eq!(final_rows(&pool, &orders).await, incremental);
    assert!(!store.get_state(&orders.id).await.unwrap().state.needs_soft_reset);

    pool.close().await;
    drop_pg_database(&config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn overwrite_replaces_the_final_table_with_each_pass() {
    init_test_tracing();
    let Some((config, pool)) = database().await else {
        return;
    };

    let countries = stream("countries", SyncMode::Overwrite);
    let engine = pg_engine(&config, &pool, 100);
    create_raw_table(&pool, &countries).await;
    insert_raw(
        &pool,
        &countries,
        &[
            ("c1", "2024-01-01T00:00:00Z", r#"{"id": 1, "status": "fr"}"#),
            ("c2", "2024-01-01T00:00:00Z", r#"{"id": 2, "status": "de"}"#),
        ],
    )
    .await;

    let report = engine.run(only(&countries)).await;
    assert!(!report.has_failures(), "{report:?}");
    assert_eq!(report.rows_merged(), 2);
    assert_eq!(
        final_rows(&pool, &countries).await,
        vec![row(1, "fr", "c1"), row(2, "de", "c2")]
    );
    assert_eq!(unloaded_raw_rows(&pool, &countries).await, 0);

    insert_raw(
        &pool,
        &countries,
        &[("c3", "2024-01-02T00:00:00Z", r#"{"id": 3, "status": "it"}"#)],
    )
    .await;
    let report = engine.run(only(&countries)).await;
    assert_eq!(report.rows_merged(), 1);
    assert_eq!(final_rows(&pool, &countries).await, vec![row(3, "it", "c3")]);

    // Without new raw rows the last table stays.
    let report = engine.run(only(&countries)).await;
    assert!(!report.has_failures(), "{report:?}");
    assert_eq!(report.rows_merged(), 0);
    assert_eq!(final_rows(&pool, &countries).await, vec![row(3, "it", "c3")]);

    let staging_tables: i64 = sqlx::query_scalar(
        "select count(*) from information_schema.tables where table_name like 'countries_%'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(staging_tables, 0);

    pool.close().await;
    drop_pg_database(&config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn second_pass_over_migrated_streams_changes_nothing() {
    init_test_tracing();
    let Some((config, pool)) = database().await else {
        return;
    };

    let orders = stream("orders", SyncMode::AppendDedup);
    let engine = pg_engine(&config, &pool, 100);
    create_raw_table(&pool, &orders).await;
    insert_raw(
        &pool,
        &orders,
        &[("r1", "2024-01-01T00:00:00Z", r#"{"id": 1, "status": "new"}"#)],
    )
    .await;

    assert!(!engine.run(only(&orders)).await.has_failures());
    let store = PostgresStateStore::with_pool(pool.clone());
    let first = store.get_state(&orders.id).await.unwrap();
    assert_eq!(first.state.version, MigrationRunner::standard().latest_version());
    let rows = final_rows(&pool, &orders).await;

    let report = engine.run(only(&orders)).await;
    assert!(!report.has_failures(), "{report:?}");
    assert!(!report.stream("public.orders").unwrap().soft_reset);
    assert_eq!(report.rows_merged(), 0);
    assert_eq!(store.get_state(&orders.id).await.unwrap(), first);
    assert_eq!(final_rows(&pool, &orders).await, rows);

    pool.close().await;
    drop_pg_database(&config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn longest_table_names_survive_overwrite_and_soft_reset() {
    init_test_tracing();
    let Some((config, pool)) = database().await else {
        return;
    };

    let engine = pg_engine(&config, &pool, 100);
    let long_name = "x".repeat(70);
    let catalog = engine
        .catalog_parser()
        .parse_str(&format!(
            r#"{{
                "streams": [
                    {{
                        "name": "{long_name}",
                        "json_schema": {{"type": "object", "properties": {{
                            "id": {{"type": "integer"}},
                            "status": {{"type": "string"}}
                        }}}},
                        "sync_mode": "overwrite"
                    }},
                    {{
                        "name": "{long_name}_dedup",
                        "json_schema": {{"type": "object", "properties": {{
                            "id": {{"type": "integer"}},
                            "status": {{"type": "string"}}
                        }}}},
                        "primary_key": [["id"]],
                        "sync_mode": "append_dedup"
                    }}
                ]
            }}"#
        ))
        .unwrap();
    assert!(catalog.rejected.is_empty());
    let overwrite = catalog.streams[0].clone();
    let dedup = catalog.streams[1].clone();
    assert_eq!(overwrite.id.final_table.name.len(), 63);
    assert_eq!(dedup.id.final_table.name.len(), 63);

    for stream in [&overwrite, &dedup] {
        create_raw_table(&pool, stream).await;
        insert_raw(
            &pool,
            stream,
            &[("r1", "2024-01-01T00:00:00Z", r#"{"id": 1, "status": "a"}"#)],
        )
        .await;
    }

    let report = engine.run(catalog.clone()).await;
    assert!(!report.has_failures(), "{report:?}");
    assert_eq!(final_rows(&pool, &overwrite).await, vec![row(1, "a", "r1")]);

    let store = PostgresStateStore::with_pool(pool.clone());
    let stored = store.get_state(&dedup.id).await.unwrap();
    store
        .set_state(&dedup.id, stored.revision, stored.state.with_soft_reset(true))
        .await
        .unwrap();
    insert_raw(
        &pool,
        &overwrite,
        &[("r2", "2024-01-02T00:00:00Z", r#"{"id": 2, "status": "b"}"#)],
    )
    .await;

    let report = engine.run(catalog).await;
    assert!(!report.has_failures(), "{report:?}");
    assert!(report.streams.iter().all(|stream| stream.soft_reset));
    assert_eq!(final_rows(&pool, &overwrite).await, vec![row(2, "b", "r2")]);
    assert_eq!(final_rows(&pool, &dedup).await, vec![row(1, "a", "r1")]);

    pool.close().await;
    drop_pg_database(&config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_declarations_create_no_tables() {
    init_test_tracing();
    let Some((config, pool)) = database().await else {
        return;
    };

    let engine = pg_engine(&config, &pool, 100);
    let catalog = engine
        .catalog_parser()
        .parse_str(
            r#"{
                "streams": [
                    {"name": "users", "json_schema": {"properties": {"id": {"type": "integer"}}}, "sync_mode": "append"},
                    {"name": "users", "json_schema": {"properties": {"id": {"type": "string"}}}, "primary_key": [["id"]], "sync_mode": "append_dedup"},
                    {"name": "orders", "json_schema": {"properties": {"id": {"type": "integer"}}}, "sync_mode": "append"}
                ]
            }"#,
        )
        .unwrap();

    let report = engine.run(catalog).await;

    assert_eq!(report.streams.len(), 3);
    assert_eq!(report.failed_streams().count(), 2);
    for failed in report.failed_streams() {
        assert_eq!(failed.stream, "public.users");
        assert_eq!(
            failed.failure.as_ref().unwrap().category,
            ErrorCategory::Configuration
        );
    }
    let users_tables: i64 = sqlx::query_scalar(
        "select count(*) from information_schema.tables where table_schema in ('public', 'airbyte_internal') and table_name like '%users%'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(users_tables, 0);

    pool.close().await;
    drop_pg_database(&config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn server_errors_carry_message_and_sqlstate() {
    init_test_tracing();
    let Some((config, pool)) = database().await else {
        return;
    };

    let executor = PgExecutor::connect(&config, Duration::from_secs(30))
        .await
        .unwrap();
    let err = executor
        .execute(r#"select * from "public"."missing""#)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DestinationQueryFailed);
    let detail = err.detail().unwrap();
    assert!(detail.contains("missing\" does not exist"), "{detail}");
    assert!(detail.contains("SQLSTATE 42P01"), "{detail}");

    drop(executor);
    pool.close().await;
    drop_pg_database(&config).await;
}
