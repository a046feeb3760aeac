//! Integration tests for db-quest.

pub mod checker_test;
pub mod config_test;
pub mod executor_test;
pub mod postgres_test;
