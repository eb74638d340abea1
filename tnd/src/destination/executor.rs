use std::future::Future;

use crate::error::TndResult;

/// One result row, with every value in its text representation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRow {
    pub columns: Vec<String>,
    pub values: Vec<Option<String>>,
}

impl QueryRow {
    pub fn new<C, V>(columns: C, values: V) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        V: IntoIterator<Item = Option<String>>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            values: values.into_iter().collect(),
        }
    }

    /// Value at position `index`; `None` for SQL `NULL` or a missing column.
    pub fn get_at(&self, index: usize) -> Option<&str> {
        self.values.get(index)?.as_deref()
    }

    /// Value of the column called `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        let index = self
            .columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))?;

        self.get_at(index)
    }
}

/// Port through which generated SQL reaches the destination.
///
/// An executor owns one destination session. Statements of one
/// [`SqlExecutor::execute_transaction`] call commit together or not at all, and
/// dropping the returned future before it resolves rolls the transaction back.
pub trait SqlExecutor {
    /// Runs one statement outside any explicit transaction and returns the rows it affected.
    fn execute(&self, statement: &str) -> impl Future<Output = TndResult<u64>> + Send;

    /// Runs `statements` in one transaction and returns the rows each one affected.
    fn execute_transaction(
        &self,
        statements: &[String],
    ) -> impl Future<Output = TndResult<Vec<u64>>> + Send;

    fn query(&self, statement: &str) -> impl Future<Output = TndResult<Vec<QueryRow>>> + Send;
}

/// Opens destination sessions. Every stream worker gets its own.
pub trait ExecutorFactory: Clone + Send + Sync + 'static {
    type Executor: SqlExecutor + Send + Sync + 'static;

    fn connect(&self) -> impl Future<Output = TndResult<Self::Executor>> + Send;
}
