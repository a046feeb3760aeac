//! Execution requests, responses and the events that carry them.
//!
//! Each request comes from a source, carries a SQL statement and is
//! identified by a unique id. Its progress is reported through a sequence of
//! [`ExecutorEvent`]s; the responses they carry must be read as delta
//! updates on a single [`ResultTable`] that the executor keeps filling in.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use super::table::ResultTable;
use crate::db::Connection;
use crate::error::QuestError;

/// The executor's unit of work. Immutable once created.
#[derive(Clone)]
pub struct ExecutionRequest {
    source_id: Arc<str>,
    unique_id: Arc<str>,
    connection: Arc<dyn Connection>,
    sql: Arc<str>,
}

impl ExecutionRequest {
    /// Creates a request with a freshly generated unique id.
    pub fn new(
        source_id: impl Into<String>,
        connection: Arc<dyn Connection>,
        sql: impl Into<String>,
    ) -> Self {
        Self::with_unique_id(
            source_id,
            uuid::Uuid::new_v4().to_string(),
            connection,
            sql,
        )
    }

    /// Creates a request with a caller-chosen unique id.
    pub fn with_unique_id(
        source_id: impl Into<String>,
        unique_id: impl Into<String>,
        connection: Arc<dyn Connection>,
        sql: impl Into<String>,
    ) -> Self {
        Self {
            source_id: Arc::from(source_id.into()),
            unique_id: Arc::from(unique_id.into()),
            connection,
            sql: Arc::from(sql.into()),
        }
    }

    /// Identity of the requester; at most one live execution per source.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Correlates all the responses to this execution.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("source_id", &self.source_id)
            .field("unique_id", &self.unique_id)
            .field("connection", &self.connection.id())
            .field("sql", &self.sql)
            .finish()
    }
}

/// Progress snapshot of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionResponse {
    request: ExecutionRequest,
    table: Arc<ResultTable>,
    /// Time since submission up to the moment the response was emitted.
    pub total_elapsed_ms: u64,
    /// Time the statement call took.
    pub execution_elapsed_ms: u64,
    /// Time spent fetching rows so far.
    pub fetch_elapsed_ms: u64,
    /// The failure, for FAILURE (and CANCELLED) events.
    pub error: Option<QuestError>,
}

impl ExecutionResponse {
    pub(crate) fn new(
        request: ExecutionRequest,
        table: Arc<ResultTable>,
        total_elapsed_ms: u64,
        execution_elapsed_ms: u64,
        fetch_elapsed_ms: u64,
    ) -> Self {
        Self {
            request,
            table,
            total_elapsed_ms,
            execution_elapsed_ms,
            fetch_elapsed_ms,
            error: None,
        }
    }

    pub(crate) fn with_error(mut self, error: QuestError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn request(&self) -> &ExecutionRequest {
        &self.request
    }

    pub fn source_id(&self) -> &str {
        self.request.source_id()
    }

    pub fn unique_id(&self) -> &str {
        self.request.unique_id()
    }

    /// The table being filled in; the same instance for every response of an execution.
    pub fn table(&self) -> &Arc<ResultTable> {
        &self.table
    }

    /// Row count of the table at the moment of the call.
    pub fn row_count(&self) -> usize {
        self.table.size()
    }
}

/// Kind of an executor event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Connection is valid, execution has started.
    Started,
    /// Execution is going well so far, a batch of rows has been collected.
    ResultsAvailable,
    /// Execution went well, all results have been collected.
    Completed,
    /// Execution was cancelled.
    Cancelled,
    /// Execution failed.
    Failure,
}

impl EventKind {
    /// True for the events that end an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::ResultsAvailable => "RESULTS_AVAILABLE",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the executor as an execution progresses.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    Started(ExecutionResponse),
    ResultsAvailable(ExecutionResponse),
    Completed(ExecutionResponse),
    Cancelled(ExecutionResponse),
    Failure(ExecutionResponse),
}

impl ExecutorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Started(_) => EventKind::Started,
            Self::ResultsAvailable(_) => EventKind::ResultsAvailable,
            Self::Completed(_) => EventKind::Completed,
            Self::Cancelled(_) => EventKind::Cancelled,
            Self::Failure(_) => EventKind::Failure,
        }
    }

    pub fn response(&self) -> &ExecutionResponse {
        match self {
            Self::Started(r)
            | Self::ResultsAvailable(r)
            | Self::Completed(r)
            | Self::Cancelled(r)
            | Self::Failure(r) => r,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// Serializable digest of the event, for logs and machine-readable output.
    pub fn summary(&self) -> EventSummary {
        let response = self.response();
        EventSummary {
            kind: self.kind(),
            source_id: response.source_id().to_string(),
            unique_id: response.unique_id().to_string(),
            rows: response.row_count(),
            total_ms: response.total_elapsed_ms,
            exec_ms: response.execution_elapsed_ms,
            fetch_ms: response.fetch_elapsed_ms,
            error: response.error.as_ref().map(ToString::to_string),
        }
    }
}

/// Flat, serializable view of an [`ExecutorEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub kind: EventKind,
    pub source_id: String,
    pub unique_id: String,
    pub rows: usize,
    pub total_ms: u64,
    pub exec_ms: u64,
    pub fetch_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Receiver of executor events.
///
/// Called from worker tasks (and from the canceller's thread for CANCELLED),
/// so implementations must be cheap and must not block.
pub trait EventListener: Send + Sync + 'static {
    fn on_event(&self, event: ExecutorEvent);
}

impl<F> EventListener for F
where
    F: Fn(ExecutorEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: ExecutorEvent) {
        self(event)
    }
}

impl EventListener for mpsc::UnboundedSender<ExecutorEvent> {
    fn on_event(&self, event: ExecutorEvent) {
        // The receiver going away just means nobody is interested anymore.
        let _ = self.send(event);
    }
}
