//! Error types for db-quest.
//!
//! Defines the main error enum used throughout the crate.

use thiserror::Error;

/// Main error type for db-quest operations.
///
/// Errors are `Clone` so that the same failure can be attached to the
/// response handed to an event listener and logged by the worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuestError {
    /// Connection errors (connection down, host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution errors (syntax errors, timeouts, fetch failures, etc.)
    #[error("Query error: {0}")]
    Query(String),

    /// The execution was cancelled, either explicitly or by preemption.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Lifecycle misuse (start twice, submit before start, etc.)
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Result table misuse (rows before metadata, width mismatch, etc.)
    #[error("Table error: {0}")]
    Table(String),

    /// Configuration errors (invalid config file, bad connection string, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QuestError {
    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates a cancellation error with the given message.
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Creates a lifecycle error with the given message.
    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }

    /// Creates a table error with the given message.
    pub fn table(msg: impl Into<String>) -> Self {
        Self::Table(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection Error",
            Self::Query(_) => "Query Error",
            Self::Cancelled(_) => "Cancelled",
            Self::Lifecycle(_) => "Lifecycle Error",
            Self::Table(_) => "Table Error",
            Self::Config(_) => "Configuration Error",
        }
    }

    /// Returns true for errors that indicate a caller bug rather than a runtime failure.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Lifecycle(_))
    }
}

/// Result type alias using QuestError.
pub type Result<T> = std::result::Result<T, QuestError>;
