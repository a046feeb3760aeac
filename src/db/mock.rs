//! Mock database connection for testing.
//!
//! Provides a scriptable in-memory connection: result sets, delays, failures
//! and validity can all be controlled by the test, and the connection keeps
//! counters of what was done to it.

use super::{ColumnInfo, ColumnType, Connection, Row, RowCursor, StatementOutcome, Value};
use crate::error::{QuestError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// What a mock connection does when a statement is executed.
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    /// Columns of the result set.
    pub columns: Vec<ColumnInfo>,
    /// Rows of the result set.
    pub rows: Vec<Row>,
    /// Delay before the statement call returns.
    pub execute_delay: Duration,
    /// Delay before each row is returned by the cursor.
    pub row_delay: Duration,
    /// Fail the statement call with this message.
    pub fail_execute: Option<String>,
    /// Fail the fetch of the row at this index with this message.
    pub fail_at_row: Option<(usize, String)>,
    /// When set the statement produces no result set, only an update count.
    pub rows_affected: Option<u64>,
}

impl MockScript {
    /// A result set with the given columns and rows.
    pub fn rows(columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            ..Self::default()
        }
    }

    /// A result set of `count` rows with an integer `id` and a text `name` column.
    pub fn generated(count: usize) -> Self {
        let columns = vec![
            ColumnInfo::new("id", ColumnType::Integer),
            ColumnInfo::new("name", ColumnType::Text),
        ];
        let rows = (0..count)
            .map(|i| vec![Value::from(i), Value::String(format!("row-{i}"))])
            .collect();
        Self::rows(columns, rows)
    }

    /// A statement without result set (DDL/DML).
    pub fn update(rows_affected: u64) -> Self {
        Self {
            rows_affected: Some(rows_affected),
            ..Self::default()
        }
    }

    /// A statement call that fails.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_execute: Some(message.into()),
            ..Self::default()
        }
    }

    /// Sets the delay before the statement call returns.
    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = delay;
        self
    }

    /// Sets the delay before each row.
    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = delay;
        self
    }

    /// Makes the fetch of row `index` fail.
    pub fn failing_at_row(mut self, index: usize, message: impl Into<String>) -> Self {
        self.fail_at_row = Some((index, message.into()));
        self
    }
}

/// A mock connection driven by [`MockScript`]s.
#[derive(Debug)]
pub struct MockConnection {
    id: String,
    open: AtomicBool,
    valid: AtomicBool,
    probe_delay: Mutex<Duration>,
    probe_error: Mutex<Option<String>>,
    default_script: Mutex<MockScript>,
    scripts: Mutex<HashMap<String, MockScript>>,
    executed: Mutex<Vec<String>>,
    open_count: AtomicUsize,
    close_count: AtomicUsize,
    probe_count: AtomicUsize,
    active_probes: AtomicUsize,
    max_concurrent_probes: AtomicUsize,
}

impl MockConnection {
    /// Creates a new closed, healthy mock connection.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            open: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            probe_delay: Mutex::new(Duration::ZERO),
            probe_error: Mutex::new(None),
            default_script: Mutex::new(MockScript::default()),
            scripts: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            open_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            probe_count: AtomicUsize::new(0),
            active_probes: AtomicUsize::new(0),
            max_concurrent_probes: AtomicUsize::new(0),
        }
    }

    /// Creates a new healthy mock connection that is already open.
    pub fn opened(id: impl Into<String>) -> Self {
        let conn = Self::new(id);
        conn.open.store(true, Ordering::SeqCst);
        conn
    }

    /// Sets the script used for any statement without a specific script.
    pub fn with_script(self, script: MockScript) -> Self {
        self.set_script(script);
        self
    }

    /// Sets the script used for any statement without a specific script.
    pub fn set_script(&self, script: MockScript) {
        *self.default_script.lock() = script;
    }

    /// Sets the script used for one specific SQL text.
    pub fn set_script_for(&self, sql: impl Into<String>, script: MockScript) {
        self.scripts.lock().insert(sql.into(), script);
    }

    /// Controls whether the server "responds" to validity probes.
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    /// Makes each validity probe take this long.
    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock() = delay;
    }

    /// Makes validity probes fail with an error instead of answering.
    pub fn set_probe_error(&self, error: Option<String>) {
        *self.probe_error.lock() = error;
    }

    /// SQL texts executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::SeqCst)
    }

    /// Highest number of validity probes that ran at the same time.
    pub fn max_concurrent_probes(&self) -> usize {
        self.max_concurrent_probes.load(Ordering::SeqCst)
    }

    fn script_for(&self, sql: &str) -> MockScript {
        if let Some(script) = self.scripts.lock().get(sql) {
            return script.clone();
        }
        self.default_script.lock().clone()
    }
}

/// Decrements the active probe counter even when the probe is dropped mid-way.
struct ActiveProbe<'a>(&'a AtomicUsize);

impl Drop for ActiveProbe<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn is_valid(&self) -> Result<bool> {
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        let active = self.active_probes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_probes.fetch_max(active, Ordering::SeqCst);
        let _active = ActiveProbe(&self.active_probes);

        let delay = *self.probe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let probe_error = self.probe_error.lock().clone();
        if let Some(error) = probe_error {
            return Err(QuestError::connection(error));
        }

        let valid = self.is_open() && self.valid.load(Ordering::SeqCst);
        self.open.store(valid, Ordering::SeqCst);
        Ok(valid)
    }

    async fn open(&self) -> Result<()> {
        if !self.open.swap(true, Ordering::SeqCst) {
            self.open_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, sql: &str, _timeout: Duration) -> Result<StatementOutcome> {
        if !self.is_open() {
            return Err(QuestError::connection(format!(
                "Connection [{}] is not open",
                self.id
            )));
        }
        self.executed.lock().push(sql.to_string());

        let script = self.script_for(sql);
        if !script.execute_delay.is_zero() {
            tokio::time::sleep(script.execute_delay).await;
        }
        if let Some(message) = script.fail_execute {
            return Err(QuestError::query(message));
        }
        if let Some(rows_affected) = script.rows_affected {
            return Ok(StatementOutcome::Update { rows_affected });
        }

        Ok(StatementOutcome::ResultSet(Box::new(MockCursor {
            columns: script.columns,
            rows: script.rows.into_iter(),
            position: 0,
            row_delay: script.row_delay,
            fail_at_row: script.fail_at_row,
        })))
    }
}

struct MockCursor {
    columns: Vec<ColumnInfo>,
    rows: std::vec::IntoIter<Row>,
    position: usize,
    row_delay: Duration,
    fail_at_row: Option<(usize, String)>,
}

#[async_trait]
impl RowCursor for MockCursor {
    fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>> {
        if !self.row_delay.is_zero() {
            tokio::time::sleep(self.row_delay).await;
        }
        if let Some((index, message)) = &self.fail_at_row {
            if *index == self.position {
                return Err(QuestError::query(message.clone()));
            }
        }
        self.position += 1;
        Ok(self.rows.next())
    }
}
