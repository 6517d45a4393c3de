//! The mapper session object
//!
//! `Mapper` owns the connection configuration, lazily opens a single data
//! connection, and exposes the SELECT/INSERT/upsert/batch helpers plus the
//! LISTEN/NOTIFY loop. It carries no internal synchronization: all methods
//! take `&mut self` and the mapper is meant to be driven from one task.

use crate::config::{ConnectionConfig, SslMode};
use crate::db::listener::{
    CHANNEL, ChangeEvent, Handler, ListenEvent, Listener, RECONNECT_MAX, RECONNECT_MIN,
    decode_payload,
};
use crate::db::types::{ColumnDef, QueryResults, decode_row};
use crate::error::DbError;
use crate::sql::{Insert, OnConflict, Select};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Connection, NoTls};
use tracing::{error, info, warn};

/// Idle wait before the listen loop proactively checks connection liveness
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// A thin data mapper over a single PostgreSQL connection.
///
/// Table names, column names, predicates, and raw conflict clauses given to
/// the helper methods are interpolated into the SQL text verbatim — they must
/// come from trusted code. Row values are always bound as statement
/// parameters.
pub struct Mapper {
    config: ConnectionConfig,
    source: String,
    idle_timeout: Duration,
    client: Option<Client>,
    handler: Option<Handler>,
}

impl Mapper {
    /// Create a mapper for `source`, the table the insert helpers target.
    ///
    /// No connection is opened until the first data operation.
    pub fn new(config: ConnectionConfig, source: impl Into<String>) -> Self {
        Self {
            config,
            source: source.into(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            client: None,
            handler: None,
        }
    }

    /// Install the callback invoked for each decoded notification.
    ///
    /// The handler runs synchronously on the listening task; a slow handler
    /// stalls notification processing.
    pub fn set_handler(&mut self, handler: impl FnMut(ChangeEvent) + Send + 'static) {
        self.handler = Some(Box::new(handler));
    }

    /// Override the listen loop's idle timeout.
    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) {
        self.idle_timeout = idle_timeout;
    }

    /// The `host/database` label used in log lines.
    pub fn db_info(&self) -> String {
        self.config.label()
    }

    /// `SELECT <columns> FROM <table> [WHERE <predicate>]`, materialized.
    pub async fn load(
        &mut self,
        table: &str,
        columns: &str,
        predicate: Option<&str>,
    ) -> Result<QueryResults, DbError> {
        let mut select = Select::new(table, columns);
        if let Some(predicate) = predicate {
            select = select.filter(predicate);
        }
        let sql = select.sql();
        self.query(&sql).await
    }

    /// Insert a single row into the source table. Fails on conflict.
    pub async fn create(
        &mut self,
        columns: &[&str],
        values: &[&(dyn ToSql + Sync)],
    ) -> Result<(), DbError> {
        check_arity(columns.len(), values.len())?;
        let sql = Insert::new(&self.source, columns).sql();
        self.run_statement(&sql, values).await
    }

    /// Insert a single row, updating the existing row when `conflict_keys`
    /// collide. An empty key set degrades to `ON CONFLICT DO NOTHING`.
    pub async fn save(
        &mut self,
        columns: &[&str],
        values: &[&(dyn ToSql + Sync)],
        conflict_keys: &[&str],
    ) -> Result<(), DbError> {
        check_arity(columns.len(), values.len())?;
        let conflict = if conflict_keys.is_empty() {
            OnConflict::DoNothing
        } else {
            OnConflict::DoUpdate {
                keys: conflict_keys.iter().map(|k| k.to_string()).collect(),
            }
        };
        let sql = Insert::new(&self.source, columns).on_conflict(conflict).sql();
        self.run_statement(&sql, values).await
    }

    /// Insert many rows in one statement, with placeholder numbering running
    /// across all rows. A no-op on an empty row set — no SQL is issued and no
    /// connection is opened.
    pub async fn insert_batch(
        &mut self,
        columns: &[&str],
        rows: &[&[&(dyn ToSql + Sync)]],
        on_conflict: Option<OnConflict>,
    ) -> Result<(), DbError> {
        if rows.is_empty() {
            return Ok(());
        }
        for row in rows {
            check_arity(columns.len(), row.len())?;
        }
        let mut insert = Insert::new(&self.source, columns).rows(rows.len());
        if let Some(conflict) = on_conflict {
            insert = insert.on_conflict(conflict);
        }
        let sql = insert.sql();
        let values: Vec<&(dyn ToSql + Sync)> =
            rows.iter().flat_map(|row| row.iter().copied()).collect();
        self.run_statement(&sql, &values).await
    }

    /// Run a raw SQL string and materialize the result rows.
    pub async fn query(&mut self, sql: &str) -> Result<QueryResults, DbError> {
        self.ensure_connected().await?;
        let client = self.client()?;
        let start = Instant::now();

        let stmt = client
            .prepare(sql)
            .await
            .map_err(|e| DbError::PrepareFailed(format!("{} ({})", e, sql)))?;
        let columns: Vec<ColumnDef> = stmt
            .columns()
            .iter()
            .map(|col| ColumnDef {
                name: col.name().to_string(),
                type_name: col.type_().name().to_string(),
            })
            .collect();

        let pg_rows = client
            .query(&stmt, &[])
            .await
            .map_err(|e| DbError::QueryFailed(e.to_string()))?;
        let rows: Vec<_> = pg_rows.iter().map(decode_row).collect();

        Ok(QueryResults {
            row_count: rows.len(),
            execution_time: start.elapsed(),
            columns,
            rows,
        })
    }

    /// Run a raw SQL string and return the affected-row count.
    pub async fn execute(&mut self, sql: &str) -> Result<u64, DbError> {
        self.ensure_connected().await?;
        let client = self.client()?;
        client
            .execute(sql, &[])
            .await
            .map_err(|e| DbError::QueryFailed(e.to_string()))
    }

    /// Drop the data connection, if any. The next data operation reconnects.
    pub fn close(&mut self) {
        if self.client.take().is_some() {
            info!("{}: closing connection", self.db_info());
        }
    }

    /// Subscribe to the notification channel and loop forever, dispatching
    /// each decoded event to the handler.
    ///
    /// Returns only if the initial connection or `LISTEN` fails. Afterwards a
    /// lost listener connection is rebuilt on a delay that doubles from
    /// 10 seconds up to 1 minute; malformed payloads are logged and skipped.
    pub async fn listen(&mut self) -> Result<(), DbError> {
        self.ensure_connected().await?;
        info!(
            "{}: listening for notifications on \"{}\"",
            self.db_info(),
            CHANNEL
        );
        let mut listener = Listener::connect(&self.config).await?;
        let mut backoff = RECONNECT_MIN;
        loop {
            match listener.next_event(self.idle_timeout).await {
                ListenEvent::Notify(notification) => {
                    backoff = RECONNECT_MIN;
                    self.dispatch(
                        notification.channel(),
                        notification.process_id(),
                        notification.payload(),
                    );
                }
                ListenEvent::Idle => {
                    info!(
                        "{}: no events for {:?}, checking connection",
                        self.db_info(),
                        self.idle_timeout
                    );
                    listener.ping();
                }
                ListenEvent::Lost => {
                    warn!(
                        "{}: listener connection lost, reconnecting in {:?}",
                        self.db_info(),
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                    match Listener::connect(&self.config).await {
                        Ok(next) => {
                            info!("{}: listener reconnected", self.db_info());
                            listener = next;
                            backoff = RECONNECT_MIN;
                        }
                        Err(e) => {
                            error!("{}: listener reconnect failed: {}", self.db_info(), e);
                        }
                    }
                }
            }
        }
    }

    /// Decode one raw payload and hand it to the handler.
    fn dispatch(&mut self, channel: &str, process_id: i32, payload: &str) {
        match decode_payload(payload) {
            Ok(value) => {
                if let Some(handler) = self.handler.as_mut() {
                    handler(ChangeEvent {
                        channel: channel.to_string(),
                        process_id,
                        payload: value,
                    });
                }
            }
            Err(e) => {
                error!(
                    "{}: malformed notification payload: {}",
                    self.config.label(),
                    e
                );
            }
        }
    }

    async fn run_statement(
        &mut self,
        sql: &str,
        values: &[&(dyn ToSql + Sync)],
    ) -> Result<(), DbError> {
        self.ensure_connected().await?;
        let client = self.client()?;
        let stmt = client
            .prepare(sql)
            .await
            .map_err(|e| DbError::PrepareFailed(format!("{} ({})", e, sql)))?;
        client
            .execute(&stmt, values)
            .await
            .map_err(|e| DbError::QueryFailed(e.to_string()))?;
        Ok(())
    }

    /// Open the data connection on first use.
    async fn ensure_connected(&mut self) -> Result<(), DbError> {
        if self.client.is_some() {
            return Ok(());
        }
        let url = self.config.connection_url();
        let label = self.db_info();
        info!("{}: connecting", label);

        let client = match self.config.ssl_mode {
            SslMode::Disable => {
                let (client, connection) = tokio_postgres::connect(&url, NoTls)
                    .await
                    .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
                spawn_connection_driver(connection, label);
                client
            }
            SslMode::Prefer | SslMode::Require => {
                let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_tls_config());
                let (client, connection) = tokio_postgres::connect(&url, tls)
                    .await
                    .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
                spawn_connection_driver(connection, label);
                client
            }
        };

        self.client = Some(client);
        Ok(())
    }

    fn client(&self) -> Result<&Client, DbError> {
        self.client.as_ref().ok_or(DbError::NotConnected)
    }
}

fn check_arity(expected: usize, actual: usize) -> Result<(), DbError> {
    if expected == actual {
        Ok(())
    } else {
        Err(DbError::ArityMismatch { expected, actual })
    }
}

/// Drive the data connection until it closes, logging a lost connection.
fn spawn_connection_driver<S, T>(connection: Connection<S, T>, label: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("{}: connection error: {}", label, e);
        }
    });
}

/// Build a rustls ClientConfig that trusts OS certificates (with Mozilla
/// roots as fallback)
pub(crate) fn make_tls_config() -> rustls::ClientConfig {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();
    let mut loaded = 0;
    for cert in native_certs.certs {
        if root_store.add(cert).is_ok() {
            loaded += 1;
        }
    }
    if loaded == 0 {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}
