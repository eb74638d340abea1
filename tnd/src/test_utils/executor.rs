use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::destination::{ExecutorFactory, QueryRow, SqlExecutor};
use crate::error::{ErrorKind, TndResult};
use crate::tnd_error;

#[derive(Debug)]
struct InjectedFailure {
    pattern: String,
    kind: ErrorKind,
    remaining: usize,
}

#[derive(Debug, Default)]
struct Inner {
    committed: Vec<Vec<String>>,
    attempts: usize,
    queries: Vec<String>,
    query_responses: Vec<(String, Vec<QueryRow>)>,
    affected_rows: Vec<(String, VecDeque<u64>)>,
    failures: Vec<InjectedFailure>,
    connect_failure: Option<ErrorKind>,
}

impl Inner {
    /// Takes one failure matching any of `statements`.
    fn take_failure<'a>(&mut self, mut statements: impl Iterator<Item = &'a str>) -> Option<ErrorKind> {
        let failures = &mut self.failures;
        statements.find_map(|statement| {
            failures
                .iter_mut()
                .find(|failure| failure.remaining > 0 && statement.contains(&failure.pattern))
                .map(|failure| {
                    failure.remaining -= 1;
                    failure.kind
                })
        })
    }

    fn affected(&mut self, statement: &str) -> u64 {
        let Some((_, counts)) = self
            .affected_rows
            .iter_mut()
            .find(|(pattern, _)| statement.contains(pattern.as_str()))
        else {
            return 0;
        };

        // The last scripted count sticks.
        if counts.len() > 1 {
            counts.pop_front().unwrap_or(0)
        } else {
            counts.front().copied().unwrap_or(0)
        }
    }
}

/// A [`SqlExecutor`] that records statements instead of running them.
///
/// Responses are scripted by substring: the first registered pattern contained in
/// a statement decides its result. Unmatched queries return no rows and unmatched
/// statements affect zero rows. Clones share the recording.
#[derive(Debug, Clone, Default)]
pub struct MockExecutor {
    inner: Arc<Mutex<Inner>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries containing `pattern` return `rows`.
    pub async fn on_query(&self, pattern: impl Into<String>, rows: Vec<QueryRow>) {
        self.inner
            .lock()
            .await
            .query_responses
            .push((pattern.into(), rows));
    }

    /// Statements containing `pattern` report the next of `counts` as affected rows.
    pub async fn on_execute(&self, pattern: impl Into<String>, counts: impl IntoIterator<Item = u64>) {
        self.inner
            .lock()
            .await
            .affected_rows
            .push((pattern.into(), counts.into_iter().collect()));
    }

    /// The next `times` transactions or queries containing `pattern` fail with `kind`.
    pub async fn fail_on(&self, pattern: impl Into<String>, kind: ErrorKind, times: usize) {
        self.inner.lock().await.failures.push(InjectedFailure {
            pattern: pattern.into(),
            kind,
            remaining: times,
        });
    }

    pub async fn fail_connect(&self, kind: ErrorKind) {
        self.inner.lock().await.connect_failure = Some(kind);
    }

    /// Transactions that committed, in order.
    pub async fn committed(&self) -> Vec<Vec<String>> {
        self.inner.lock().await.committed.clone()
    }

    /// Statements of all committed transactions, flattened.
    pub async fn statements(&self) -> Vec<String> {
        self.committed().await.into_iter().flatten().collect()
    }

    pub async fn statements_containing(&self, pattern: &str) -> Vec<String> {
        self.statements()
            .await
            .into_iter()
            .filter(|statement| statement.contains(pattern))
            .collect()
    }

    /// Transactions attempted, including failed ones.
    pub async fn attempts(&self) -> usize {
        self.inner.lock().await.attempts
    }

    pub async fn queries(&self) -> Vec<String> {
        self.inner.lock().await.queries.clone()
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.committed.clear();
        inner.queries.clear();
        inner.attempts = 0;
    }
}

fn injected(kind: ErrorKind, statement: &str) -> crate::error::TndError {
    tnd_error!(kind, "Injected executor failure", statement)
}

impl SqlExecutor for MockExecutor {
    async fn execute(&self, statement: &str) -> TndResult<u64> {
        let affected = self.execute_transaction(&[statement.to_string()]).await?;

        Ok(affected.first().copied().unwrap_or(0))
    }

    async fn execute_transaction(&self, statements: &[String]) -> TndResult<Vec<u64>> {
        let mut inner = self.inner.lock().await;
        inner.attempts += 1;

        if let Some(kind) = inner.take_failure(statements.iter().map(String::as_str)) {
            return Err(injected(kind, statements.first().map_or("", String::as_str)));
        }

        let affected = statements
            .iter()
            .map(|statement| inner.affected(statement))
            .collect();
        inner.committed.push(statements.to_vec());

        Ok(affected)
    }

    async fn query(&self, statement: &str) -> TndResult<Vec<QueryRow>> {
        let mut inner = self.inner.lock().await;
        inner.queries.push(statement.to_string());

        if let Some(kind) = inner.take_failure(std::iter::once(statement)) {
            return Err(injected(kind, statement));
        }

        let rows = inner
            .query_responses
            .iter()
            .find(|(pattern, _)| statement.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();

        Ok(rows)
    }
}

/// Hands out clones of one [`MockExecutor`], so every worker records into it.
#[derive(Debug, Clone, Default)]
pub struct MockExecutorFactory {
    executor: MockExecutor,
}

impl MockExecutorFactory {
    pub fn new(executor: MockExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &MockExecutor {
        &self.executor
    }
}

impl ExecutorFactory for MockExecutorFactory {
    type Executor = MockExecutor;

    async fn connect(&self) -> TndResult<MockExecutor> {
        if let Some(kind) = self.executor.inner.lock().await.connect_failure {
            return Err(tnd_error!(kind, "Injected connection failure"));
        }

        Ok(self.executor.clone())
    }
}
