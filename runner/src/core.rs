use std::time::Duration;

use config::shared::{DialectKind, RunnerConfig, StateStoreConfig};
use postgres::migrations::apply_state_store_migrations;
use tnd::TndEngine;
use tnd::destination::PgExecutorFactory;
use tnd::report::SyncReport;
use tnd::store::{DestinationStateStore, MemoryStateStore, PostgresStateStore};
use tracing::{info, warn};

// Statically dispatches the pass over the concrete state store type.
macro_rules! run_pass_dispatch {
    ($runner_config:expr, $factory:expr, $state_store:expr) => {{
        let engine = TndEngine::new($runner_config.engine.clone(), $factory, $state_store)?;
        run_engine(engine, &$runner_config).await
    }};
}

/// Runs one pass over the configured catalog and returns its report.
pub async fn run_pass(runner_config: RunnerConfig) -> anyhow::Result<SyncReport> {
    if runner_config.engine.dialect != DialectKind::Postgres {
        anyhow::bail!(
            "the runner only supports the postgres dialect, got {:?}",
            runner_config.engine.dialect
        );
    }

    let factory = PgExecutorFactory::new(
        runner_config.destination.clone(),
        Duration::from_millis(runner_config.engine.statement_timeout_ms),
    );

    match runner_config.state_store {
        StateStoreConfig::Memory => {
            warn!("using the in-memory state store, destination state is lost on exit");
            run_pass_dispatch!(runner_config, factory, MemoryStateStore::new())
        }
        StateStoreConfig::Postgres => {
            apply_state_store_migrations(&runner_config.destination).await?;
            let state_store = PostgresStateStore::new(&runner_config.destination);
            run_pass_dispatch!(runner_config, factory, state_store)
        }
    }
}

async fn run_engine<S>(
    engine: TndEngine<PgExecutorFactory, S>,
    runner_config: &RunnerConfig,
) -> anyhow::Result<SyncReport>
where
    S: DestinationStateStore + Clone + Send + Sync + 'static,
{
    let catalog = engine
        .catalog_parser()
        .load(&runner_config.catalog_path)
        .await?;

    let shutdown_tx = engine.shutdown_tx();
    let signal_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl+c received, cancelling the pass");
            if shutdown_tx.shutdown().is_err() {
                warn!("the pass already finished");
            }
        }
    });

    let report = engine.run(catalog).await;
    signal_handle.abort();

    info!(report = %serde_json::to_string(&report)?, "pass report");

    Ok(report)
}
