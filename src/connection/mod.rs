//! Connection management for db-quest.
//!
//! Keeps the named connections and watches over the open ones.

pub mod checker;
pub mod registry;

pub use checker::ConnectionLivenessChecker;
pub use registry::ConnectionRegistry;
