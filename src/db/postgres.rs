//! PostgreSQL connection implementation.
//!
//! Provides the `PostgresConnection` struct that implements the `Connection`
//! trait for PostgreSQL databases using sqlx.

use crate::config::ConnectionConfig;
use crate::db::{ColumnInfo, Connection, Row, RowCursor, StatementOutcome, Value};
use crate::error::{QuestError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as SqlxColumn, Executor, Row as SqlxRow, Statement, TypeInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Time allowed to establish the connection.
const LOGIN_TIMEOUT_SECS: u64 = 10;

/// Time allowed for the validity probe.
const VALIDITY_TIMEOUT_SECS: u64 = 10;

/// Time allowed for the pool to shut down on close.
const CLOSE_TIMEOUT_MS: u64 = 500;

/// Rows buffered between the fetching task and the cursor.
const FETCH_CHANNEL_CAPACITY: usize = 1024;

/// One connection serves statements, the other serves validity probes, so a
/// long-running fetch never makes the probe time out.
const POOL_SIZE: u32 = 2;

/// PostgreSQL database connection.
///
/// The underlying pool is created by `open()` and dropped by `close()`.
#[derive(Debug)]
pub struct PostgresConnection {
    id: String,
    config: ConnectionConfig,
    pool: Mutex<Option<PgPool>>,
    open: AtomicBool,
    open_lock: tokio::sync::Mutex<()>,
    validity_timeout: Duration,
}

impl PostgresConnection {
    /// Creates a new, not yet opened, connection.
    pub fn new(id: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            id: id.into(),
            config,
            pool: Mutex::new(None),
            open: AtomicBool::new(false),
            open_lock: tokio::sync::Mutex::new(()),
            validity_timeout: Duration::from_secs(VALIDITY_TIMEOUT_SECS),
        }
    }

    /// Returns the connection settings.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Opens a throwaway connection, checks it and closes it again.
    ///
    /// Fails if a connection could not be established should `open()` be called.
    pub async fn test_connectivity(&self) -> Result<()> {
        let pool = self.connect_pool(1).await?;
        let probe = tokio::time::timeout(
            self.validity_timeout,
            sqlx::query("SELECT 1").execute(&pool),
        )
        .await;
        pool.close().await;
        match probe {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(map_connection_error(e, &self.config)),
            Err(_) => Err(QuestError::connection(format!(
                "Connection with {} is not valid (tried for {} secs)",
                self.config.display_string(),
                self.validity_timeout.as_secs()
            ))),
        }
    }

    async fn connect_pool(&self, max_connections: u32) -> Result<PgPool> {
        let conn_str = self.config.to_connection_string()?;
        PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(LOGIN_TIMEOUT_SECS))
            .connect(&conn_str)
            .await
            .map_err(|e| map_connection_error(e, &self.config))
    }

    fn pool(&self) -> Result<PgPool> {
        self.pool
            .lock()
            .clone()
            .ok_or_else(|| QuestError::connection(format!("Connection [{}] is not open", self.id)))
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn is_valid(&self) -> Result<bool> {
        let pool = self.pool.lock().clone();
        let Some(pool) = pool else {
            return Ok(false);
        };

        let probe = tokio::time::timeout(
            self.validity_timeout,
            sqlx::query("SELECT 1").execute(&pool),
        )
        .await;

        let valid = match probe {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(connection = %self.id, "Validity probe failed: {e}");
                false
            }
            Err(_) => {
                debug!(connection = %self.id, "Validity probe timed out");
                false
            }
        };
        self.open.store(valid, Ordering::SeqCst);
        Ok(valid)
    }

    async fn open(&self) -> Result<()> {
        let _guard = self.open_lock.lock().await;
        if self.is_open() {
            return Ok(());
        }

        info!(connection = %self.id, "Connecting to {}", self.config.display_string());
        let pool = self.connect_pool(POOL_SIZE).await?;
        *self.pool.lock() = Some(pool);
        self.open.store(true, Ordering::SeqCst);
        info!(connection = %self.id, "Connected");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _guard = self.open_lock.lock().await;
        self.open.store(false, Ordering::SeqCst);
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            info!(connection = %self.id, "Closing");
            // A dead server can keep the pool from draining, don't wait on it forever.
            if tokio::time::timeout(Duration::from_millis(CLOSE_TIMEOUT_MS), pool.close())
                .await
                .is_err()
            {
                warn!(connection = %self.id, "Pool did not close in time, dropping it");
            }
            info!(connection = %self.id, "Closed");
        }
        Ok(())
    }

    /// `timeout` is enforced on the client only: it bounds the prepare, an
    /// update's execution and the wait for the first row. Nothing is sent to
    /// the server, and rows after the first are fetched without a bound.
    async fn execute(&self, sql: &str, timeout: Duration) -> Result<StatementOutcome> {
        let pool = self.pool()?;

        // Preparing tells us whether the statement returns rows, and their
        // columns, before any row is fetched.
        let statement = tokio::time::timeout(timeout, (&pool).prepare(sql))
            .await
            .map_err(|_| timeout_error(timeout))?
            .map_err(|e| QuestError::query(format_query_error(e)))?;

        let columns: Vec<ColumnInfo> = statement
            .columns()
            .iter()
            .map(|col| ColumnInfo::from_type_name(col.name(), col.type_info().name()))
            .collect();

        if columns.is_empty() {
            let result = tokio::time::timeout(timeout, sqlx::query(sql).execute(&pool))
                .await
                .map_err(|_| timeout_error(timeout))?
                .map_err(|e| QuestError::query(format_query_error(e)))?;
            return Ok(StatementOutcome::Update {
                rows_affected: result.rows_affected(),
            });
        }

        let (tx, rx) = mpsc::channel(FETCH_CHANNEL_CAPACITY);
        let sql = sql.to_string();
        let producer = tokio::spawn(async move {
            let mut rows = sqlx::query(&sql).fetch(&pool);
            while let Some(item) = rows.next().await {
                let item = item
                    .map(|row| convert_row(&row))
                    .map_err(|e| QuestError::query(format_query_error(e)));
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(StatementOutcome::ResultSet(Box::new(PgRowCursor {
            columns,
            rows: rx,
            producer,
            first_row_timeout: Some(timeout),
        })))
    }
}

/// Cursor fed by a task streaming rows off the pool.
struct PgRowCursor {
    columns: Vec<ColumnInfo>,
    rows: mpsc::Receiver<Result<Row>>,
    producer: JoinHandle<()>,
    /// Client-side bound on the wait for the first row, unset afterwards.
    first_row_timeout: Option<Duration>,
}

#[async_trait]
impl RowCursor for PgRowCursor {
    fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>> {
        let next = match self.first_row_timeout.take() {
            Some(timeout) => tokio::time::timeout(timeout, self.rows.recv())
                .await
                .map_err(|_| timeout_error(timeout))?,
            None => self.rows.recv().await,
        };
        next.transpose()
    }
}

impl Drop for PgRowCursor {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

fn timeout_error(timeout: Duration) -> QuestError {
    QuestError::query(format!(
        "Query timed out after {} seconds",
        timeout.as_secs()
    ))
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "OID" => row
            .try_get::<Option<sqlx::postgres::types::Oid>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v.0 as i64))
            .unwrap_or(Value::Null),

        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        // For all other types, try to get as string
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Maps sqlx connection errors to user-friendly messages.
fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> QuestError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port;
    let user = config.user.as_deref().unwrap_or("unknown");
    let database = config.database.as_deref().unwrap_or("unknown");

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        QuestError::connection(format!(
            "Cannot connect to {host}:{port}. Check that the server is running."
        ))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        QuestError::connection(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        QuestError::connection(format!("Database '{database}' does not exist."))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        QuestError::connection(format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        QuestError::connection(error.to_string())
    }
}

/// Formats a query error with hints if available.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = String::from("ERROR: ");
    result.push_str(db_error.message());

    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }
        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }
        if let Some(table) = pg_error.table() {
            result.push_str("\n  TABLE: ");
            result.push_str(table);
        }
    }

    result
}
