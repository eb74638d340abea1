use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx, is_shutdown_requested, run_until_shutdown};
use crate::destination::executor::SqlExecutor;
use crate::destination::metadata::{self, parse_count};
use crate::destination::retry::RetryPolicy;
use crate::error::{ErrorKind, TndResult};
use crate::failpoints::{
    HANDLER_AFTER_MERGE_BEFORE_STATE_PERSIST, HANDLER_BEFORE_MERGE_BATCH,
    HANDLER_BETWEEN_PLAN_TRANSACTIONS, tnd_fail_point,
};
use crate::migration::{MigrationContext, MigrationRunner};
use crate::sql::{BatchPlan, MergeOptions, RebuildSource, Sql, SqlGenerator};
use crate::store::DestinationStateStore;
use crate::types::{DestinationState, StagingTable, StreamConfig, SyncMode, VersionedState};
use crate::{bail, tnd_error};

/// Phases a stream goes through within one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerPhase {
    Init,
    MigrationCheck,
    SoftReset,
    Overwrite,
    IncrementalMerge,
    StatePersist,
    Done,
    Failed,
}

impl fmt::Display for HandlerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerPhase::Init => "init",
            HandlerPhase::MigrationCheck => "migration_check",
            HandlerPhase::SoftReset => "soft_reset",
            HandlerPhase::Overwrite => "overwrite",
            HandlerPhase::IncrementalMerge => "incremental_merge",
            HandlerPhase::StatePersist => "state_persist",
            HandlerPhase::Done => "done",
            HandlerPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a successful run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Raw rows merged by incremental batches, or rows written by a rebuild.
    pub rows_merged: u64,
    pub cast_errors: u64,
    pub soft_reset: bool,
}

/// Row counts reported by the statements of one [`BatchPlan`].
#[derive(Debug, Clone, Copy)]
struct PlanCounts {
    claimed: u64,
    written: u64,
}

/// Settings shared by every handler of a pass.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub generator: SqlGenerator,
    pub migrations: Arc<MigrationRunner>,
    pub retry: RetryPolicy,
    pub batch_size: u64,
    /// Mark every raw row as pending before merging.
    pub reprocess_raw: bool,
}

/// Brings one stream's final table up to date with its raw table.
///
/// The state is persisted only after every statement of the run committed, so a
/// failed or cancelled run leaves the stored state untouched.
pub struct DestinationHandler<E, S> {
    executor: E,
    store: S,
    settings: HandlerSettings,
    shutdown_rx: ShutdownRx,
    phase: HandlerPhase,
    last_stamp: Option<DateTime<Utc>>,
}

impl<E, S> DestinationHandler<E, S>
where
    E: SqlExecutor,
    S: DestinationStateStore,
{
    pub fn new(executor: E, store: S, settings: HandlerSettings, shutdown_rx: ShutdownRx) -> Self {
        Self {
            executor,
            store,
            settings,
            shutdown_rx,
            phase: HandlerPhase::Init,
            last_stamp: None,
        }
    }

    pub fn phase(&self) -> HandlerPhase {
        self.phase
    }

    pub async fn run(&mut self, stream: &StreamConfig) -> TndResult<StreamOutcome> {
        self.phase = HandlerPhase::Init;

        match self.run_phases(stream).await {
            Ok(outcome) => {
                self.transition(stream, HandlerPhase::Done);
                info!(
                    stream = %stream.id,
                    rows = outcome.rows_merged,
                    cast_errors = outcome.cast_errors,
                    soft_reset = outcome.soft_reset,
                    "stream merged"
                );

                Ok(outcome)
            }
            Err(err) => {
                let failed_in = self.phase;
                self.transition(stream, HandlerPhase::Failed);
                error!(stream = %stream.id, phase = %failed_in, error = %err, "stream failed");

                Err(err)
            }
        }
    }

    async fn run_phases(&mut self, stream: &StreamConfig) -> TndResult<StreamOutcome> {
        let generator = self.settings.generator.clone();
        let id = &stream.id;
        let mut outcome = StreamOutcome::default();

        // Init
        self.check_cancelled(stream)?;
        let schemas = Sql::concat([
            generator.create_schema(&id.raw.namespace),
            generator.create_schema(&id.final_table.namespace),
        ]);
        self.execute_sql(stream, &schemas, "create_schemas").await?;

        let mut tables = self
            .call("describe_tables", || {
                metadata::fetch_existing_tables(&self.executor, &generator, id)
            })
            .await?;
        let stored: VersionedState = self
            .call("get_state", || self.store.get_state(id))
            .await?;
        debug!(stream = %id, revision = stored.revision, state = ?stored.state, "loaded destination state");

        // MigrationCheck
        self.transition(stream, HandlerPhase::MigrationCheck);
        let context = MigrationContext {
            stream,
            tables: &tables,
            generator: &generator,
        };
        let migrated = self.settings.migrations.apply_due(stored.state, &context)?;
        let mut state = migrated.state;

        let migration_ran = !migrated.statements.is_empty();
        self.execute_sql(stream, &migrated.statements, "migrate").await?;
        self.execute_sql(stream, &generator.create_raw_table(id), "create_raw_table")
            .await?;
        if migration_ran {
            tables.final_table = self
                .call("describe_final_table", || {
                    metadata::describe_table(&self.executor, &generator, &id.final_table)
                })
                .await?;
        }

        match &tables.final_table {
            None => {
                self.execute_sql(
                    stream,
                    &generator.create_final_table(stream, "", false),
                    "create_final_table",
                )
                .await?;
            }
            Some(existing) if !generator.existing_schema_matches(stream, existing) => {
                info!(stream = %id, "final table schema differs from the declaration");
                state = state.with_soft_reset(true);
            }
            Some(_) => {}
        }

        if self.settings.reprocess_raw {
            self.execute_sql(stream, &generator.clear_loaded_at(id), "clear_loaded_at")
                .await?;
        }

        if stream.sync_mode == SyncMode::Overwrite {
            self.transition(stream, HandlerPhase::Overwrite);
            if self.overwrite(stream, &mut outcome).await? {
                state = state.with_soft_reset(false);
            }
        } else if state.needs_soft_reset {
            self.transition(stream, HandlerPhase::SoftReset);
            self.soft_reset(stream, &mut outcome).await?;
            state = state.with_soft_reset(false);
        } else {
            self.transition(stream, HandlerPhase::IncrementalMerge);
            self.incremental_merge(stream, &mut outcome).await?;
        }

        // StatePersist
        self.transition(stream, HandlerPhase::StatePersist);
        tnd_fail_point(HANDLER_AFTER_MERGE_BEFORE_STATE_PERSIST)?;
        self.persist_state(stream, stored, state).await?;

        Ok(outcome)
    }

    async fn soft_reset(&mut self, stream: &StreamConfig, outcome: &mut StreamOutcome) -> TndResult<()> {
        let loaded_at = self.next_stamp();
        let generator = self.settings.generator.clone();

        let counts = self
            .run_typed(stream, "soft_reset", |safer_casting| {
                generator.soft_reset(stream, &self.merge_options(loaded_at, safer_casting))
            })
            .await?;

        outcome.rows_merged += counts.written;
        outcome.cast_errors += self.count_cast_errors(stream, loaded_at).await?;
        outcome.soft_reset = true;

        Ok(())
    }

    /// Replaces the final table with the rows of this pass. Returns whether it did.
    async fn overwrite(&mut self, stream: &StreamConfig, outcome: &mut StreamOutcome) -> TndResult<bool> {
        let generator = self.settings.generator.clone();
        let status = self
            .call("raw_table_status", || {
                metadata::fetch_raw_table_status(&self.executor, &generator, &stream.id)
            })
            .await?;

        if !status.has_unloaded_rows() {
            info!(stream = %stream.id, "no new raw rows, keeping the current final table");
            return Ok(false);
        }

        let loaded_at = self.next_stamp();
        let staging = StagingTable::for_stream(
            &stream.id,
            StagingTable::OVERWRITE_SUFFIX,
            &generator.dialect().naming,
        );
        let counts = self
            .run_typed(stream, "overwrite", |safer_casting| {
                generator.rebuild(
                    stream,
                    &staging,
                    RebuildSource::CurrentPass,
                    &self.merge_options(loaded_at, safer_casting),
                )
            })
            .await?;

        outcome.rows_merged += counts.written;
        outcome.cast_errors += self.count_cast_errors(stream, loaded_at).await?;
        outcome.soft_reset = true;

        Ok(true)
    }

    /// Merges batches until one claims fewer rows than the batch size.
    async fn incremental_merge(&mut self, stream: &StreamConfig, outcome: &mut StreamOutcome) -> TndResult<()> {
        let generator = self.settings.generator.clone();
        let batch_size = self.settings.batch_size;

        loop {
            self.check_cancelled(stream)?;
            tnd_fail_point(HANDLER_BEFORE_MERGE_BATCH)?;

            let loaded_at = self.next_stamp();
            let claimed = self
                .run_typed(stream, "merge_batch", |safer_casting| {
                    generator.update_table(stream, &self.merge_options(loaded_at, safer_casting))
                })
                .await?
                .claimed;

            outcome.rows_merged += claimed;
            if claimed > 0 {
                outcome.cast_errors += self.count_cast_errors(stream, loaded_at).await?;
            }
            debug!(stream = %stream.id, rows = claimed, "merged batch");

            if claimed < batch_size {
                return Ok(());
            }
        }
    }

    async fn persist_state(
        &self,
        stream: &StreamConfig,
        stored: VersionedState,
        state: DestinationState,
    ) -> TndResult<()> {
        if !stored.is_new() && stored.state == state {
            return Ok(());
        }

        let revision = self
            .call("set_state", || {
                self.store.set_state(&stream.id, stored.revision, state)
            })
            .await?;
        debug!(stream = %stream.id, revision, state = ?state, "stored destination state");

        Ok(())
    }

    /// Runs a claiming plan with plain casts, then once more with safer casts if a
    /// value could not be converted.
    async fn run_typed<P>(&self, stream: &StreamConfig, operation: &'static str, plan: P) -> TndResult<PlanCounts>
    where
        P: Fn(bool) -> TndResult<BatchPlan>,
    {
        let plain = plan(false)?;
        let (plan, affected) = match self.execute_sql(stream, &plain.sql, operation).await {
            Ok(affected) => (plain, affected),
            Err(err) if err.kind() == ErrorKind::DataConversion => {
                warn!(stream = %stream.id, error = %err, "plain casts failed, retrying with safer casts");
                let safer = plan(true)?;
                let affected = self.execute_sql(stream, &safer.sql, operation).await?;
                (safer, affected)
            }
            Err(err) => return Err(err),
        };

        let count = |position: usize| affected.get(position).copied().unwrap_or(0);
        Ok(PlanCounts {
            claimed: count(plan.claim_position),
            written: count(plan.written_position),
        })
    }

    async fn count_cast_errors(&self, stream: &StreamConfig, loaded_at: DateTime<Utc>) -> TndResult<u64> {
        let query = self.settings.generator.count_cast_errors(stream, loaded_at);
        let rows = self
            .call("count_cast_errors", || self.executor.query(&query))
            .await?;

        parse_count(&rows)
    }

    /// Executes each transaction of `sql` in order. Returns the affected row counts
    /// of all statements, flattened.
    async fn execute_sql(&self, stream: &StreamConfig, sql: &Sql, operation: &'static str) -> TndResult<Vec<u64>> {
        let mut affected = Vec::new();
        for (index, transaction) in sql.transactions().iter().enumerate() {
            if index > 0 {
                tnd_fail_point(HANDLER_BETWEEN_PLAN_TRANSACTIONS)?;
            }
            debug!(stream = %stream.id, operation, statements = ?transaction, "executing transaction");
            let counts = self
                .call(operation, || self.executor.execute_transaction(transaction))
                .await?;
            affected.extend(counts);
        }

        Ok(affected)
    }

    /// Runs a destination call with local retry, abandoning it on shutdown.
    ///
    /// An abandoned transaction is rolled back by the executor.
    async fn call<F, Fut, T>(&self, operation: &'static str, f: F) -> TndResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TndResult<T>>,
    {
        let mut shutdown_rx = self.shutdown_rx.clone();
        match run_until_shutdown(&mut shutdown_rx, self.settings.retry.run(operation, f)).await {
            ShutdownResult::Ok(result) => result,
            ShutdownResult::Shutdown(()) => Err(tnd_error!(
                ErrorKind::Cancelled,
                "Stream processing was cancelled",
                format!("shutdown requested during {operation}")
            )),
        }
    }

    fn check_cancelled(&self, stream: &StreamConfig) -> TndResult<()> {
        if is_shutdown_requested(&self.shutdown_rx) {
            bail!(
                ErrorKind::Cancelled,
                "Stream processing was cancelled",
                format!("shutdown requested before stream {} finished", stream.id)
            );
        }

        Ok(())
    }

    fn merge_options(&self, loaded_at: DateTime<Utc>, safer_casting: bool) -> MergeOptions {
        MergeOptions {
            loaded_at,
            batch_size: self.settings.batch_size,
            safer_casting,
        }
    }

    /// A microsecond stamp later than every stamp this handler produced before.
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let now = now
            .duration_trunc(TimeDelta::microseconds(1))
            .unwrap_or(now);

        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);

        stamp
    }

    fn transition(&mut self, stream: &StreamConfig, to: HandlerPhase) {
        info!(stream = %stream.id, from = %self.phase, to = %to, "handler transition");
        self.phase = to;
    }
}
