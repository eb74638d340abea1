use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::destination::StreamOutcome;
use crate::error::{ErrorKind, TndResult};
use crate::{bail, tnd_error};

/// Result of one stream worker, keyed by the declared stream name.
pub type WorkerResult = (String, TndResult<StreamOutcome>);

/// Runs stream workers in parallel, at most `max_workers` at a time.
///
/// A stream can be scheduled once per pool. Scheduling it again while it is
/// known to the pool is refused, so two workers never merge the same stream
/// concurrently.
#[derive(Debug)]
pub struct StreamWorkerPool {
    scheduled: HashSet<String>,
    permits: Arc<Semaphore>,
    join_set: JoinSet<WorkerResult>,
}

impl StreamWorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            scheduled: HashSet::new(),
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            join_set: JoinSet::new(),
        }
    }

    pub fn is_scheduled(&self, stream: &str) -> bool {
        self.scheduled.contains(stream)
    }

    /// Spawns `future` as the worker of `stream`. It starts once a permit is free.
    pub fn spawn<F>(&mut self, stream: impl Into<String>, future: F) -> TndResult<()>
    where
        F: Future<Output = TndResult<StreamOutcome>> + Send + 'static,
    {
        let stream = stream.into();
        if !self.scheduled.insert(stream.clone()) {
            bail!(
                ErrorKind::InvalidState,
                "Stream is already scheduled",
                format!("stream {stream} has a worker in this pass")
            );
        }

        let permits = self.permits.clone();
        let key = stream.clone();
        self.join_set.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(tnd_error!(
                        ErrorKind::StreamWorkerPanic,
                        "Stream worker panicked",
                        panic_message(panic.as_ref())
                    )),
                },
                Err(_) => Err(tnd_error!(
                    ErrorKind::InvalidState,
                    "Stream worker pool was closed"
                )),
            };

            (key, result)
        });

        debug!(stream = %stream, "spawned stream worker");

        Ok(())
    }

    /// Waits for every worker and returns their results in completion order.
    pub async fn wait_all(mut self) -> Vec<WorkerResult> {
        let mut results = Vec::with_capacity(self.scheduled.len());

        while let Some(joined) = self.join_set.join_next().await {
            match joined {
                Ok((stream, result)) => {
                    if let Err(err) = &result {
                        error!(stream = %stream, error = %err, "stream worker completed with error");
                    }
                    results.push((stream, result));
                }
                Err(join_err) => {
                    // Panics are caught inside the task, so only aborts land here.
                    debug!(error = %join_err, "stream worker task was cancelled");
                }
            }
        }

        results
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
