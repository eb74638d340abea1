use std::collections::HashMap;
use std::sync::Arc;

use config::shared::EngineConfig;
use tracing::{info, warn};

use crate::catalog::{CatalogParser, ParsedCatalog};
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::destination::{DestinationHandler, ExecutorFactory, HandlerSettings, RetryPolicy};
use crate::error::{ErrorKind, TndResult};
use crate::migration::MigrationRunner;
use crate::report::{StreamReport, SyncReport};
use crate::sql::{Dialect, SqlGenerator};
use crate::store::DestinationStateStore;
use crate::tnd_error;
use crate::workers::StreamWorkerPool;

/// Runs typing and deduplication passes over a set of streams.
///
/// Every stream gets its own handler and destination connection. Streams fail
/// independently: a failed stream is reported while the others keep going.
#[derive(Debug)]
pub struct TndEngine<F, S> {
    config: EngineConfig,
    factory: F,
    store: S,
    settings: HandlerSettings,
    shutdown_tx: ShutdownTx,
    shutdown_rx: ShutdownRx,
}

impl<F, S> TndEngine<F, S>
where
    F: ExecutorFactory,
    S: DestinationStateStore + Clone + Send + Sync + 'static,
{
    pub fn new(config: EngineConfig, factory: F, store: S) -> TndResult<Self> {
        config.validate().map_err(|err| {
            tnd_error!(
                ErrorKind::ConfigError,
                "Engine configuration is invalid",
                source: err
            )
        })?;

        let settings = HandlerSettings {
            generator: SqlGenerator::new(Dialect::for_kind(config.dialect)),
            migrations: Arc::new(MigrationRunner::standard()),
            retry: RetryPolicy::from_engine_config(&config),
            batch_size: config.batch_size,
            reprocess_raw: config.reprocess_raw_tables,
        };
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        Ok(Self {
            config,
            factory,
            store,
            settings,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Replaces the built-in migrations.
    pub fn with_migrations(mut self, migrations: MigrationRunner) -> Self {
        self.settings.migrations = Arc::new(migrations);
        self
    }

    /// A parser resolving catalogs against this engine's dialect and namespaces.
    pub fn catalog_parser(&self) -> CatalogParser {
        CatalogParser::new(
            self.settings.generator.dialect(),
            self.config.raw_namespace.clone(),
            self.config.default_namespace.clone(),
        )
    }

    /// Sender that cancels the running pass. In-flight transactions roll back.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Processes every accepted stream of `catalog` and reports the outcome.
    ///
    /// Streams the catalog rejected are reported as failed without touching the
    /// destination. Reports follow the catalog order of accepted streams, then the
    /// rejected ones.
    pub async fn run(&self, catalog: ParsedCatalog) -> SyncReport {
        info!(
            streams = catalog.streams.len(),
            rejected = catalog.rejected.len(),
            workers = self.config.max_concurrent_streams,
            "starting typing and deduplication pass"
        );

        let mut pool = StreamWorkerPool::new(usize::from(self.config.max_concurrent_streams));
        let mut reports: HashMap<String, StreamReport> = HashMap::new();

        for stream in &catalog.streams {
            let key = stream.id.to_string();
            let factory = self.factory.clone();
            let store = self.store.clone();
            let settings = self.settings.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            let stream = stream.clone();

            let spawned = pool.spawn(key.clone(), async move {
                let executor = factory.connect().await?;
                let mut handler = DestinationHandler::new(executor, store, settings, shutdown_rx);

                handler.run(&stream).await
            });

            if let Err(err) = spawned {
                warn!(stream = %key, error = %err, "stream was not scheduled");
                reports.insert(key.clone(), StreamReport::failed(key, &err));
            }
        }

        for (key, result) in pool.wait_all().await {
            let report = match result {
                Ok(outcome) => StreamReport::succeeded(
                    key.clone(),
                    outcome.rows_merged,
                    outcome.cast_errors,
                    outcome.soft_reset,
                ),
                Err(err) => StreamReport::failed(key.clone(), &err),
            };
            // A refused duplicate keeps the report of the worker that ran.
            reports.insert(key, report);
        }

        let mut report = SyncReport::default();
        for stream in &catalog.streams {
            if let Some(stream_report) = reports.remove(&stream.id.to_string()) {
                report.streams.push(stream_report);
            }
        }
        for rejected in &catalog.rejected {
            warn!(stream = %rejected.stream, error = %rejected.error, "stream rejected by the catalog");
            report
                .streams
                .push(StreamReport::failed(rejected.stream.clone(), &rejected.error));
        }

        info!(%report, "typing and deduplication pass finished");

        report
    }
}
