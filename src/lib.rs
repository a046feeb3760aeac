//! db-quest - asynchronous SQL execution core.
//!
//! Runs one SQL execution per logical source at a time, streams results in
//! growing batches into a shared result table, supports cancellation and
//! preemption, and watches over the liveness of open connections.

pub mod cli;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod logging;
pub mod query;
