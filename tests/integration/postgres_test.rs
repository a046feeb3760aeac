//! PostgreSQL integration tests.
//!
//! These tests require a running PostgreSQL database.
//! Set DATABASE_URL environment variable to run them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use db_quest::config::{ConnectionConfig, ExecutorConfig};
use db_quest::db::{Connection, PostgresConnection, StatementOutcome, Value};
use db_quest::query::{EventKind, ExecutionRequest, ExecutorEvent, QueryExecutor};
use tokio::sync::mpsc;

/// Helper to get test database URL from environment.
fn get_test_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

/// Helper to create an opened test connection.
async fn get_test_connection() -> Option<Arc<PostgresConnection>> {
    let url = get_test_database_url()?;
    let config = ConnectionConfig::from_connection_string(&url).ok()?;
    let conn = PostgresConnection::new("test", config);
    conn.open().await.ok()?;
    Some(Arc::new(conn))
}

async fn run_to_end(
    executor: &QueryExecutor,
    conn: Arc<PostgresConnection>,
    unique_id: &str,
    sql: &str,
) -> Vec<(EventKind, usize, ExecutorEvent)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(EventKind, usize, ExecutorEvent)>();
    let request = ExecutionRequest::with_unique_id("editor-1", unique_id, conn, sql);
    executor
        .submit(request, move |event: ExecutorEvent| {
            let _ = tx.send((event.kind(), event.response().row_count(), event));
        })
        .unwrap();

    let mut seen = Vec::new();
    loop {
        let item = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("listener dropped");
        let done = item.0.is_terminal();
        seen.push(item);
        if done {
            return seen;
        }
    }
}

fn started_executor() -> QueryExecutor {
    let executor = QueryExecutor::new(ExecutorConfig::default());
    executor.start().unwrap();
    executor
}

#[tokio::test]
async fn test_open_and_validate() {
    let Some(conn) = get_test_connection().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    assert!(conn.is_open());
    assert!(conn.is_valid().await.unwrap());
    conn.test_connectivity().await.unwrap();

    conn.close().await.unwrap();
    assert!(!conn.is_open());
    assert!(!conn.is_valid().await.unwrap());
}

#[tokio::test]
async fn test_columns_known_before_rows() {
    let Some(conn) = get_test_connection().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let outcome = conn
        .execute(
            "SELECT 1::int4 AS num, 'hello'::text AS greeting, true AS flag",
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    let StatementOutcome::ResultSet(mut cursor) = outcome else {
        panic!("Expected a result set");
    };

    let names: Vec<&str> = cursor.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["num", "greeting", "flag"]);

    let row = cursor.next_row().await.unwrap().unwrap();
    assert_eq!(
        row,
        vec![Value::Int(1), Value::String("hello".to_string()), Value::Bool(true)]
    );
    assert!(cursor.next_row().await.unwrap().is_none());

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_query_timeout_bounds_wait_for_first_row() {
    let Some(conn) = get_test_connection().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let outcome = conn
        .execute("SELECT pg_sleep(5)", Duration::from_secs(1))
        .await
        .unwrap();
    let StatementOutcome::ResultSet(mut cursor) = outcome else {
        panic!("Expected a result set");
    };

    let started = std::time::Instant::now();
    let err = cursor.next_row().await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(3));
    drop(cursor);

    conn.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streams_generated_rows_in_batches() {
    let Some(conn) = get_test_connection().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let executor = started_executor();

    let seen = run_to_end(
        &executor,
        conn.clone(),
        "r1",
        "SELECT g AS id, 'row-' || g AS name FROM generate_series(1, 250) g",
    )
    .await;
    let kinds: Vec<(EventKind, usize)> = seen.iter().map(|(k, n, _)| (*k, *n)).collect();
    assert_eq!(
        kinds,
        vec![
            (EventKind::Started, 0),
            (EventKind::ResultsAvailable, 100),
            (EventKind::ResultsAvailable, 200),
            (EventKind::Completed, 250),
        ]
    );

    let table = seen[3].2.response().table();
    assert_eq!(table.column_names().unwrap(), vec!["#", "id", "name"]);
    assert_eq!(table.value(0, 1), Some(Value::Int(1)));
    assert_eq!(table.value(249, 2), Some(Value::String("row-250".to_string())));

    executor.close().await.unwrap();
    conn.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ddl_produces_status_table() {
    let Some(conn) = get_test_connection().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let executor = started_executor();

    let seen = run_to_end(
        &executor,
        conn.clone(),
        "ddl",
        "CREATE TEMPORARY TABLE IF NOT EXISTS quest_probe (id int)",
    )
    .await;
    let (kind, _, event) = seen.last().unwrap();
    assert_eq!(*kind, EventKind::Completed);
    assert!(event.response().table().is_status_result());

    executor.close().await.unwrap();
    conn.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_syntax_error_is_failure() {
    let Some(conn) = get_test_connection().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let executor = started_executor();

    let seen = run_to_end(&executor, conn.clone(), "bad", "SELEC 1").await;
    let kinds: Vec<EventKind> = seen.iter().map(|(k, _, _)| *k).collect();
    assert_eq!(kinds, vec![EventKind::Started, EventKind::Failure]);
    let error = seen[1].2.response().error.as_ref().unwrap();
    assert!(error.to_string().to_lowercase().contains("syntax"));

    executor.close().await.unwrap();
    conn.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_long_running_query() {
    let Some(conn) = get_test_connection().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let executor = started_executor();

    let (tx, mut rx) = mpsc::unbounded_channel::<ExecutorEvent>();
    let request = ExecutionRequest::with_unique_id(
        "editor-1",
        "sleepy",
        conn.clone(),
        "SELECT pg_sleep(20), 1 AS one",
    );
    executor.submit(request.clone(), tx).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = std::time::Instant::now();
    executor.cancel_existing_request(&request).unwrap();

    let mut kinds: HashMap<EventKind, usize> = HashMap::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
        *kinds.entry(event.kind()).or_default() += 1;
    }
    assert_eq!(kinds.get(&EventKind::Cancelled), Some(&1));
    assert_eq!(kinds.get(&EventKind::Completed), None);
    assert!(started.elapsed() < Duration::from_secs(5));

    executor.close().await.unwrap();
    conn.close().await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn test_connect_with_invalid_port() {
    let config = ConnectionConfig {
        host: Some("localhost".to_string()),
        port: 59999, // Unlikely to be in use
        database: Some("testdb".to_string()),
        user: Some("testuser".to_string()),
        password: Some("testpass".to_string()),
    };

    let conn = PostgresConnection::new("bad-port", config);
    assert!(conn.test_connectivity().await.is_err());
    assert!(conn.open().await.is_err());
    assert!(!conn.is_open());
}
