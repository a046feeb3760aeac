//! Executor integration tests.
//!
//! Drives the executor through its public API with mock connections and a
//! channel listener, the way an editor pane would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use db_quest::config::{CheckerConfig, ExecutorConfig};
use db_quest::connection::{ConnectionLivenessChecker, ConnectionRegistry};
use db_quest::db::{Connection, MockConnection, MockScript};
use db_quest::error::QuestError;
use db_quest::query::{EventKind, ExecutionRequest, ExecutorEvent, QueryExecutor};
use tokio::sync::mpsc;

fn executor(workers: usize) -> QueryExecutor {
    let executor = QueryExecutor::new(ExecutorConfig {
        workers,
        ..ExecutorConfig::default()
    });
    executor.start().unwrap();
    executor
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ExecutorEvent>) -> ExecutorEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Collects events until every id in `unique_ids` has had its terminal event.
async fn collect_until_done(
    rx: &mut mpsc::UnboundedReceiver<ExecutorEvent>,
    unique_ids: &[&str],
) -> HashMap<String, Vec<ExecutorEvent>> {
    let mut by_id: HashMap<String, Vec<ExecutorEvent>> = HashMap::new();
    let mut pending: Vec<String> = unique_ids.iter().map(|id| id.to_string()).collect();
    while !pending.is_empty() {
        let event = next_event(rx).await;
        let id = event.response().unique_id().to_string();
        if event.is_terminal() {
            pending.retain(|p| *p != id);
        }
        by_id.entry(id).or_default().push(event);
    }
    by_id
}

/// STARTED, any number of RESULTS_AVAILABLE, then exactly one terminal event.
fn assert_well_formed(events: &[ExecutorEvent]) {
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind()).collect();
    let (last, rest) = kinds.split_last().expect("no events");
    assert!(last.is_terminal(), "last event not terminal: {kinds:?}");
    if let Some((first, middle)) = rest.split_first() {
        assert_eq!(*first, EventKind::Started, "unexpected order: {kinds:?}");
        assert!(
            middle.iter().all(|k| *k == EventKind::ResultsAvailable),
            "unexpected order: {kinds:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_sources_each_get_ordered_events() {
    let executor = executor(2);
    let conn = Arc::new(MockConnection::opened("mock"));
    conn.set_script_for("SELECT small", MockScript::generated(50));
    conn.set_script_for("SELECT medium", MockScript::generated(300));
    conn.set_script_for("SELECT large", MockScript::generated(5_000));

    let (tx, mut rx) = mpsc::unbounded_channel();
    for (source, id, sql) in [
        ("editor-1", "small", "SELECT small"),
        ("editor-2", "medium", "SELECT medium"),
        ("editor-3", "large", "SELECT large"),
    ] {
        let request = ExecutionRequest::with_unique_id(source, id, conn.clone(), sql);
        executor.submit(request, tx.clone()).unwrap();
    }

    let by_id = collect_until_done(&mut rx, &["small", "medium", "large"]).await;
    for (id, expected_rows) in [("small", 50), ("medium", 300), ("large", 5_000)] {
        let events = &by_id[id];
        assert_well_formed(events);
        let last = events.last().unwrap();
        assert_eq!(last.kind(), EventKind::Completed);
        assert_eq!(last.response().table().size(), expected_rows);
    }
    // 100, 200, 400, 800, 1600, 3200
    let batches = by_id["large"]
        .iter()
        .filter(|e| e.kind() == EventKind::ResultsAvailable)
        .count();
    assert_eq!(batches, 6);

    executor.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rapid_resubmission_only_last_completes() {
    let executor = executor(1);
    let conn = Arc::new(MockConnection::opened("mock"));
    conn.set_script_for(
        "SELECT slow",
        MockScript::generated(1_000).with_row_delay(Duration::from_millis(5)),
    );
    conn.set_script_for("SELECT last", MockScript::generated(10));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let ids = ["q1", "q2", "q3", "q4", "q5"];
    for (i, id) in ids.iter().enumerate() {
        let sql = if i == ids.len() - 1 { "SELECT last" } else { "SELECT slow" };
        let request = ExecutionRequest::with_unique_id("editor-1", *id, conn.clone(), sql);
        executor.submit(request, tx.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let by_id = collect_until_done(&mut rx, &ids).await;
    for id in &ids[..4] {
        let events = &by_id[*id];
        assert_well_formed(events);
        assert_eq!(events.last().unwrap().kind(), EventKind::Cancelled, "{id}");
    }
    let last = by_id["q5"].last().unwrap();
    assert_eq!(last.kind(), EventKind::Completed);
    assert_eq!(last.response().table().size(), 10);
    assert_eq!(executor.in_flight(), 0);

    executor.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_connection_fails_next_execution() {
    let registry = Arc::new(ConnectionRegistry::new());
    let conn = Arc::new(MockConnection::new("warehouse").with_script(MockScript::generated(3)));
    registry.add(conn.clone() as Arc<dyn Connection>);
    assert!(registry.open_all().await.is_empty());

    let executor = executor(1);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let before = ExecutionRequest::with_unique_id("editor-1", "before", conn.clone(), "SELECT 1");
    executor.submit(before, tx.clone()).unwrap();
    let by_id = collect_until_done(&mut rx, &["before"]).await;
    assert_eq!(by_id["before"].last().unwrap().kind(), EventKind::Completed);

    // The server goes away.
    conn.set_valid(false);
    let checker = ConnectionLivenessChecker::new(
        registry.supplier(),
        registry.lost_handler(),
        CheckerConfig::default(),
    );
    let lost = checker.check_now().await.unwrap();
    assert_eq!(lost.len(), 1);
    assert!(!conn.is_open());

    let after = ExecutionRequest::with_unique_id("editor-1", "after", conn.clone(), "SELECT 1");
    executor.submit(after, tx).unwrap();
    let by_id = collect_until_done(&mut rx, &["after"]).await;
    let events = &by_id["after"];
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), EventKind::Failure);
    assert!(matches!(
        events[0].response().error,
        Some(QuestError::Connection(_))
    ));

    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_consumer_clears_table_after_use() {
    let executor = executor(1);
    let conn = Arc::new(MockConnection::opened("mock").with_script(MockScript::generated(120)));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let request = ExecutionRequest::with_unique_id("editor-1", "r1", conn, "SELECT * FROM t");
    executor.submit(request, tx).unwrap();
    let by_id = collect_until_done(&mut rx, &["r1"]).await;

    let table = Arc::clone(by_id["r1"][0].response().table());
    assert_eq!(table.size(), 120);
    table.clear();
    assert_eq!(table.size(), 0);
    assert!(!table.has_column_metadata());

    executor.close().await.unwrap();
}
