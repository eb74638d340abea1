use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use config::shared::{IntoConnectOptions, PgConnectionConfig};
use rustls::ClientConfig;
use tokio::sync::Mutex;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, Config, Connection, NoTls, SimpleQueryMessage, Socket};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{Instrument, debug, error, info};

use crate::destination::executor::{ExecutorFactory, QueryRow, SqlExecutor};
use crate::error::TndResult;

/// Spawns a background task driving a Postgres connection until it terminates.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        match connection.await {
            Err(err) => error!(error = %err, "destination connection failed"),
            Ok(()) => debug!("destination connection terminated"),
        }
    }
    .instrument(span);

    tokio::spawn(task);
}

/// Rows affected by the last command of a simple-query response.
fn affected_rows(messages: &[SimpleQueryMessage]) -> u64 {
    messages
        .iter()
        .rev()
        .find_map(|message| match message {
            SimpleQueryMessage::CommandComplete(rows) => Some(*rows),
            _ => None,
        })
        .unwrap_or(0)
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<QueryRow> {
    messages
        .into_iter()
        .filter_map(|message| match message {
            SimpleQueryMessage::Row(row) => {
                let columns = row.columns().iter().map(|column| column.name().to_string());
                let values = (0..row.len()).map(|index| row.get(index).map(str::to_string));
                Some(QueryRow::new(columns, values))
            }
            _ => None,
        })
        .collect()
}

/// [`SqlExecutor`] over one `tokio-postgres` session, using the simple-query protocol.
///
/// The session runs in UTC with the configured `statement_timeout`.
#[derive(Debug)]
pub struct PgExecutor {
    client: Mutex<Client>,
}

impl PgExecutor {
    pub async fn connect(
        config: &PgConnectionConfig,
        statement_timeout: Duration,
    ) -> TndResult<Self> {
        let pg_config: Config = config.with_db();

        let client = if config.tls.enabled {
            let mut root_store = rustls::RootCertStore::empty();
            let mut root_certs_reader = BufReader::new(config.tls.trusted_root_certs.as_bytes());
            for cert in rustls_pemfile::certs(&mut root_certs_reader) {
                let cert = cert?;
                root_store.add(cert)?;
            }

            // sqlx enables ring too, so there is no unambiguous process default.
            let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
            let tls_config = ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()?
                .with_root_certificates(root_store)
                .with_no_client_auth();

            let (client, connection) = pg_config.connect(MakeRustlsConnect::new(tls_config)).await?;
            spawn_postgres_connection::<MakeRustlsConnect>(connection);
            info!(host = %config.host, "connected to destination with tls");

            client
        } else {
            let (client, connection) = pg_config.connect(NoTls).await?;
            spawn_postgres_connection::<NoTls>(connection);
            info!(host = %config.host, "connected to destination without tls");

            client
        };

        client
            .simple_query(&format!(
                "SET statement_timeout = {}; SET TIME ZONE 'UTC'",
                statement_timeout.as_millis()
            ))
            .await?;

        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

impl SqlExecutor for PgExecutor {
    async fn execute(&self, statement: &str) -> TndResult<u64> {
        let client = self.client.lock().await;
        let messages = client.simple_query(statement).await?;

        Ok(affected_rows(&messages))
    }

    async fn execute_transaction(&self, statements: &[String]) -> TndResult<Vec<u64>> {
        let mut client = self.client.lock().await;

        // Dropping `transaction` without committing rolls it back.
        let transaction = client.transaction().await?;
        let mut affected = Vec::with_capacity(statements.len());
        for statement in statements {
            let messages = transaction.simple_query(statement).await?;
            affected.push(affected_rows(&messages));
        }
        transaction.commit().await?;

        Ok(affected)
    }

    async fn query(&self, statement: &str) -> TndResult<Vec<QueryRow>> {
        let client = self.client.lock().await;
        let messages = client.simple_query(statement).await?;

        Ok(rows(messages))
    }
}

/// Opens one [`PgExecutor`] per stream worker.
#[derive(Debug, Clone)]
pub struct PgExecutorFactory {
    config: PgConnectionConfig,
    statement_timeout: Duration,
}

impl PgExecutorFactory {
    pub fn new(config: PgConnectionConfig, statement_timeout: Duration) -> Self {
        Self {
            config,
            statement_timeout,
        }
    }
}

impl ExecutorFactory for PgExecutorFactory {
    type Executor = PgExecutor;

    async fn connect(&self) -> TndResult<PgExecutor> {
        PgExecutor::connect(&self.config, self.statement_timeout).await
    }
}
