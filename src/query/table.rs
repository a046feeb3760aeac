//! Incrementally built, thread-safe result table.
//!
//! A table is identified by a key (the unique id of the request that
//! produced it), has column metadata and a list of rows in insertion order.
//! One writer (the executing worker) appends while any number of readers
//! look at it; every access goes through a reader/writer lock, so a reader
//! never sees a partially built row.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::db::{ColumnInfo, ColumnType, Value};
use crate::error::{QuestError, Result};

/// Name of the synthetic row-sequence column, always the first column.
pub const ROWID_COL_NAME: &str = "#";

/// Name of the single column of a status table.
pub const STATUS_COL_NAME: &str = "Status";

/// Value of the status table for statements that completed without result set.
pub const STATUS_OK: &str = "OK";

/// A row of a [`ResultTable`].
///
/// `values[0]` is the row id, the remaining values are parallel to the
/// table's user columns.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    index: usize,
    values: Vec<Value>,
}

impl TableRow {
    /// Insertion index, which is also the row's identity.
    pub fn index(&self) -> usize {
        self.index
    }

    /// All values, row id first.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value at column `col`, `None` when out of range.
    pub fn value(&self, col: usize) -> Option<&Value> {
        self.values.get(col)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Default)]
struct TableData {
    /// Includes the row id column; `None` until metadata is set.
    columns: Option<Vec<ColumnInfo>>,
    rows: Vec<Arc<TableRow>>,
}

/// Result table shared between the executing worker and its consumers.
#[derive(Debug)]
pub struct ResultTable {
    key: String,
    data: RwLock<TableData>,
}

impl ResultTable {
    /// Creates an empty table without column metadata.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data: RwLock::new(TableData::default()),
        }
    }

    /// Key of the table, equal to the unique id of the originating request.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Sets the column metadata and clears the rows.
    ///
    /// The row id column is prepended to `columns`. Metadata is set once per
    /// execution: setting it again with a different width fails, `clear()`
    /// the table first to reuse it.
    pub fn set_column_metadata(&self, columns: &[ColumnInfo]) -> Result<()> {
        if columns.is_empty() {
            return Err(QuestError::table(
                "no column metadata (names, types) were found",
            ));
        }

        let mut all = Vec::with_capacity(columns.len() + 1);
        all.push(ColumnInfo::new(ROWID_COL_NAME, ColumnType::RowId));
        all.extend_from_slice(columns);

        let mut data = self.data.write();
        if let Some(existing) = &data.columns {
            if existing.len() != all.len() {
                return Err(QuestError::table(format!(
                    "column metadata already set with {} columns, cannot change to {}",
                    existing.len() - 1,
                    columns.len()
                )));
            }
        }
        data.columns = Some(all);
        data.rows.clear();
        Ok(())
    }

    /// Appends a row, returning its index.
    ///
    /// Fails without touching the table when metadata is not set or the
    /// number of values does not match the user columns.
    pub fn append_row(&self, values: Vec<Value>) -> Result<usize> {
        let mut data = self.data.write();
        let Some(columns) = &data.columns else {
            return Err(QuestError::table("column metadata (names, types) not defined"));
        };
        if values.len() + 1 != columns.len() {
            return Err(QuestError::table(format!(
                "row has {} values, table has {} columns",
                values.len(),
                columns.len() - 1
            )));
        }

        let index = data.rows.len();
        let mut row_values = Vec::with_capacity(values.len() + 1);
        row_values.push(Value::from(index));
        row_values.extend(values);
        data.rows.push(Arc::new(TableRow {
            index,
            values: row_values,
        }));
        Ok(index)
    }

    /// Replaces the contents with a single-row, single-column status table.
    pub fn set_status(&self, message: impl Into<String>) {
        let mut data = self.data.write();
        data.columns = Some(vec![
            ColumnInfo::new(ROWID_COL_NAME, ColumnType::RowId),
            ColumnInfo::new(STATUS_COL_NAME, ColumnType::Text),
        ]);
        data.rows.clear();
        data.rows.push(Arc::new(TableRow {
            index: 0,
            values: vec![Value::Int(0), Value::String(message.into())],
        }));
    }

    /// Releases all rows and the column metadata.
    pub fn clear(&self) {
        let mut data = self.data.write();
        data.columns = None;
        data.rows.clear();
    }

    /// Number of rows.
    pub fn size(&self) -> usize {
        self.data.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of columns, row id column included; 0 without metadata.
    pub fn column_count(&self) -> usize {
        self.data.read().columns.as_ref().map_or(0, Vec::len)
    }

    pub fn has_column_metadata(&self) -> bool {
        self.data.read().columns.is_some()
    }

    pub fn column_name(&self, idx: usize) -> Option<String> {
        let data = self.data.read();
        data.columns.as_ref()?.get(idx).map(|c| c.name.clone())
    }

    pub fn column_type(&self, idx: usize) -> Option<ColumnType> {
        let data = self.data.read();
        data.columns.as_ref()?.get(idx).map(|c| c.column_type.clone())
    }

    /// Column names, row id column first; `None` until metadata arrives.
    pub fn column_names(&self) -> Option<Vec<String>> {
        let data = self.data.read();
        data.columns
            .as_ref()
            .map(|cols| cols.iter().map(|c| c.name.clone()).collect())
    }

    /// Column types, row id column first; `None` until metadata arrives.
    pub fn column_types(&self) -> Option<Vec<ColumnType>> {
        let data = self.data.read();
        data.columns
            .as_ref()
            .map(|cols| cols.iter().map(|c| c.column_type.clone()).collect())
    }

    /// Index of the first column with the given name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let data = self.data.read();
        data.columns.as_ref()?.iter().position(|c| c.name == name)
    }

    /// Value at (`row`, `col`), `None` when either is out of range.
    pub fn value(&self, row: usize, col: usize) -> Option<Value> {
        let data = self.data.read();
        data.rows.get(row)?.value(col).cloned()
    }

    /// Row at `idx`.
    pub fn row(&self, idx: usize) -> Option<Arc<TableRow>> {
        self.data.read().rows.get(idx).cloned()
    }

    /// Snapshot of the rows in `range`, clamped to the current size.
    pub fn rows(&self, range: Range<usize>) -> Vec<Arc<TableRow>> {
        let data = self.data.read();
        let end = range.end.min(data.rows.len());
        let start = range.start.min(end);
        data.rows[start..end].to_vec()
    }

    /// True for a single row with a single text column: a status or message
    /// result (DDL/DML acknowledgement) rather than tabular data.
    pub fn is_status_result(&self) -> bool {
        let data = self.data.read();
        match &data.columns {
            Some(cols) => {
                data.rows.len() == 1 && cols.len() == 2 && cols[1].column_type.is_text()
            }
            None => false,
        }
    }
}
