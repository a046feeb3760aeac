//! Liveness checker integration tests.
//!
//! Runs the scheduled checker against a registry of mock connections.

use std::sync::Arc;
use std::time::Duration;

use db_quest::config::CheckerConfig;
use db_quest::connection::{ConnectionLivenessChecker, ConnectionRegistry};
use db_quest::db::{Connection, MockConnection};
use tokio::sync::mpsc;

fn config() -> CheckerConfig {
    CheckerConfig {
        period_secs: 1,
        probe_timeout_secs: 2,
        shutdown_grace_ms: 200,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scheduled_check_reports_lost_connection() {
    let registry = Arc::new(ConnectionRegistry::new());
    let alive = Arc::new(MockConnection::opened("alive"));
    let dying = Arc::new(MockConnection::opened("dying"));
    let idle = Arc::new(MockConnection::new("idle"));
    registry.add(alive.clone() as Arc<dyn Connection>);
    registry.add(dying.clone() as Arc<dyn Connection>);
    registry.add(idle.clone() as Arc<dyn Connection>);

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<String>>();
    let checker = ConnectionLivenessChecker::new(
        registry.supplier(),
        move |lost: Vec<Arc<dyn Connection>>| {
            let _ = tx.send(lost.iter().map(|c| c.id().to_string()).collect());
        },
        config(),
    );
    checker.start().unwrap();
    dying.set_valid(false);

    let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no lost connection report")
        .unwrap();
    assert_eq!(report, vec!["dying".to_string()]);

    checker.close().await;
    assert!(!checker.is_running());
    assert!(alive.is_open());
    assert!(!dying.is_open());
    assert_eq!(idle.probe_count(), 0);
    assert_eq!(registry.open_connections().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_aborts_in_flight_probes() {
    let registry = Arc::new(ConnectionRegistry::new());
    let hung = Arc::new(MockConnection::opened("hung"));
    hung.set_probe_delay(Duration::from_secs(30));
    registry.add(hung.clone() as Arc<dyn Connection>);

    let checker = ConnectionLivenessChecker::new(
        registry.supplier(),
        registry.lost_handler(),
        CheckerConfig {
            probe_timeout_secs: 60,
            ..config()
        },
    );
    checker.start().unwrap();
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    assert_eq!(hung.probe_count(), 1);

    let started = std::time::Instant::now();
    checker.close().await;
    assert!(started.elapsed() < Duration::from_secs(1));

    // Aborted probes release their slot shortly after.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(hung.is_open());
    assert_eq!(hung.probe_count(), 1);
    assert_eq!(hung.max_concurrent_probes(), 1);
}
