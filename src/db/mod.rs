//! Database abstraction layer for db-quest.
//!
//! Provides a trait-based interface for the connection collaborator the
//! executor and the liveness checker work against, allowing different
//! database backends to be used interchangeably.

mod mock;
mod postgres;
mod types;

pub use mock::{MockConnection, MockScript};
pub use postgres::PostgresConnection;
pub use types::{ColumnInfo, ColumnType, Value};

use crate::config::ConnectionConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A row of data as produced by a driver cursor, without the row id.
pub type Row = Vec<Value>;

/// Creates an (unopened) database connection for the given configuration.
///
/// This is the central factory function for database connections.
pub fn connect(name: &str, config: &ConnectionConfig) -> Arc<dyn Connection> {
    Arc::new(PostgresConnection::new(name, config.clone()))
}

/// Result of sending a SQL statement down a connection.
pub enum StatementOutcome {
    /// The statement produced a result set; rows are pulled from the cursor.
    ResultSet(Box<dyn RowCursor>),
    /// The statement did not produce a result set (DDL/DML).
    Update { rows_affected: u64 },
}

impl fmt::Debug for StatementOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResultSet(cursor) => f
                .debug_struct("ResultSet")
                .field("columns", &cursor.columns())
                .finish(),
            Self::Update { rows_affected } => f
                .debug_struct("Update")
                .field("rows_affected", rows_affected)
                .finish(),
        }
    }
}

/// Forward-only cursor over the rows of a result set.
///
/// Column metadata is available as soon as the cursor exists, before any
/// row is fetched. Dropping the cursor abandons the remaining rows.
#[async_trait]
pub trait RowCursor: Send {
    /// Column metadata of the result set.
    fn columns(&self) -> &[ColumnInfo];

    /// Fetches the next row, `None` once the result set is exhausted.
    async fn next_row(&mut self) -> Result<Option<Row>>;
}

/// Trait defining the interface of a database connection.
///
/// Implementations use interior mutability; all methods take `&self` so a
/// connection can be shared between the executor, the liveness checker and
/// the caller through `Arc<dyn Connection>`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Stable identity of the connection, used in logs and reports.
    fn id(&self) -> &str;

    /// Returns true if `open()` succeeded and no validity check has failed since.
    fn is_open(&self) -> bool;

    /// Probes the server. A failed probe marks the connection as not open.
    async fn is_valid(&self) -> Result<bool>;

    /// Opens the connection. Opening an open connection is a no-op.
    async fn open(&self) -> Result<()>;

    /// Closes the connection. Closing a closed connection is a no-op.
    async fn close(&self) -> Result<()>;

    /// Executes a SQL statement, bounding the statement call by `timeout`.
    async fn execute(&self, sql: &str, timeout: Duration) -> Result<StatementOutcome>;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .finish()
    }
}
