//! Query execution for db-quest.
//!
//! This module holds the asynchronous executor, the requests and events it
//! works with, and the result table it fills in.

pub mod executor;
pub mod request;
pub mod table;

pub use executor::{BatchPolicy, QueryExecutor};
pub use request::{
    EventKind, EventListener, EventSummary, ExecutionRequest, ExecutionResponse, ExecutorEvent,
};
pub use table::{ResultTable, TableRow, ROWID_COL_NAME, STATUS_COL_NAME, STATUS_OK};
