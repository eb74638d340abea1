/// Statements to run, grouped into transactions.
///
/// Executors apply each transaction atomically and the transactions in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sql {
    transactions: Vec<Vec<String>>,
}

impl Sql {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single statement in its own transaction.
    pub fn of(statement: impl Into<String>) -> Self {
        Self::transactionally([statement])
    }

    /// All statements in one transaction.
    pub fn transactionally<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sql = Self::empty();
        sql.push_transaction(statements.into_iter().map(Into::into).collect());
        sql
    }

    /// Every statement in a transaction of its own.
    pub fn separately<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sql = Self::empty();
        for statement in statements {
            sql.push_transaction(vec![statement.into()]);
        }
        sql
    }

    /// Transactions of every part, in order.
    pub fn concat<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = Sql>,
    {
        Self {
            transactions: parts
                .into_iter()
                .flat_map(|part| part.transactions)
                .collect(),
        }
    }

    fn push_transaction(&mut self, statements: Vec<String>) {
        let statements: Vec<String> = statements
            .into_iter()
            .filter(|statement| !statement.trim().is_empty())
            .collect();

        if !statements.is_empty() {
            self.transactions.push(statements);
        }
    }

    pub fn transactions(&self) -> &[Vec<String>] {
        &self.transactions
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// All statements, flattened.
    pub fn statements(&self) -> impl Iterator<Item = &str> {
        self.transactions.iter().flatten().map(String::as_str)
    }
}
