//! Configuration integration tests.
//!
//! Loads a configuration file and wires the components it describes.

use std::io::Write;
use std::time::Duration;

use db_quest::config::Config;
use db_quest::connection::{ConnectionLivenessChecker, ConnectionRegistry};
use db_quest::db::{Connection, MockConnection};
use db_quest::query::QueryExecutor;
use pretty_assertions::assert_eq;
use std::sync::Arc;

const CONFIG: &str = r#"
[executor]
workers = 2
start_batch_size = 50
query_timeout_secs = 5

[checker]
period_secs = 10

[connections.local]
host = "localhost"
database = "postgres"
user = "postgres"

[connections.reporting]
host = "reports.internal"
port = 6432
database = "reports"
"#;

#[tokio::test]
async fn test_components_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();

    let config = Config::load_from_file(file.path()).unwrap();
    assert_eq!(config.executor.workers, 2);
    assert_eq!(config.executor.start_batch_size, 50);
    assert_eq!(config.executor.max_batch_size, 20_000);
    assert_eq!(config.executor.query_timeout(), Duration::from_secs(5));
    assert_eq!(config.checker.period(), Duration::from_secs(10));
    assert_eq!(config.checker.probe_timeout(), Duration::from_secs(10));

    let registry = Arc::new(ConnectionRegistry::from_config(&config));
    assert_eq!(
        registry.ids(),
        vec!["local".to_string(), "reporting".to_string()]
    );
    assert!(registry.open_connections().is_empty());

    let executor = QueryExecutor::new(config.executor.clone());
    executor.start().unwrap();
    assert!(executor.is_running());
    executor.close().await.unwrap();

    // Nothing is open, so a check cycle has nothing to probe.
    let checker = ConnectionLivenessChecker::new(
        registry.supplier(),
        registry.lost_handler(),
        config.checker.clone(),
    );
    assert_eq!(checker.check_now().await.map(|lost| lost.len()), Some(0));
}

#[test]
fn test_missing_config_file_gives_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_from_file(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.executor.workers, 1);
    assert_eq!(config.executor.start_batch_size, 100);
    assert_eq!(config.checker.period_secs, 30);
    assert!(config.connections.is_empty());
}

#[test]
fn test_invalid_executor_section_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"[executor]\nworkers = 0\n").unwrap();

    let err = Config::load_from_file(file.path()).unwrap_err();
    assert_eq!(err.category(), "Configuration Error");
}

#[test]
fn test_zero_timeouts_are_rejected() {
    for content in [
        "[checker]\nprobe_timeout_secs = 0\n",
        "[checker]\nperiod_secs = 0\n",
        "[executor]\nquery_timeout_secs = 0\n",
    ] {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();

        let err = Config::load_from_file(file.path()).unwrap_err();
        assert_eq!(err.category(), "Configuration Error", "{content}");
    }
}

#[tokio::test]
async fn test_loaded_checker_config_keeps_healthy_connection_open() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"[checker]\nprobe_timeout_secs = 1\n").unwrap();
    let config = Config::load_from_file(file.path()).unwrap();

    let registry = Arc::new(ConnectionRegistry::new());
    let conn = Arc::new(MockConnection::opened("slow-probe"));
    conn.set_probe_delay(Duration::from_millis(5));
    registry.add(conn.clone() as Arc<dyn Connection>);

    let checker = ConnectionLivenessChecker::new(
        registry.supplier(),
        registry.lost_handler(),
        config.checker.clone(),
    );
    assert_eq!(checker.check_now().await.map(|lost| lost.len()), Some(0));
    assert!(conn.is_open());
}
