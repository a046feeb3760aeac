//! db-quest - runs SQL statements through the asynchronous executor.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use db_quest::cli::{Cli, CLI_SOURCE_ID};
use db_quest::config::{Config, ConnectionConfig};
use db_quest::connection::{ConnectionLivenessChecker, ConnectionRegistry};
use db_quest::db::{self, Connection, MockConnection, MockScript};
use db_quest::logging::{init_file_logging, init_stderr_logging};
use db_quest::query::{EventKind, ExecutionRequest, ExecutorEvent, QueryExecutor, ResultTable};

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse_args();
    if cli.log_file {
        init_file_logging();
    } else {
        init_stderr_logging();
    }

    if let Err(message) = cli.validate() {
        eprintln!("error: {message}");
        return ExitCode::from(2);
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns false when a statement did not complete.
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let mut config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    cli.apply_overrides(&mut config.executor);
    config.executor.validate()?;
    config.checker.validate()?;

    let connection: Arc<dyn Connection> = if cli.mock_db {
        Arc::new(MockConnection::new("mock").with_script(MockScript::generated(cli.mock_rows)))
    } else {
        let (name, conn_config) = resolve_connection(&cli, &config)?
            .context("No database connection configured. Use --help for usage information.")?;
        info!("Connection: {}", conn_config.display_string());
        db::connect(&name, &conn_config)
    };

    let registry = Arc::new(ConnectionRegistry::new());
    registry.add(Arc::clone(&connection));
    if let Some((id, e)) = registry.open_all().await.into_iter().next() {
        anyhow::bail!("Could not open connection [{id}]: {e}");
    }

    if cli.check {
        let checker = ConnectionLivenessChecker::new(
            registry.supplier(),
            registry.lost_handler(),
            config.checker.clone(),
        );
        let lost = checker.check_now().await.unwrap_or_default();
        report_check(&registry, &lost, cli.json)?;
    }

    let executor = QueryExecutor::new(config.executor.clone());
    executor.start()?;

    let (tx, mut rx) = mpsc::unbounded_channel::<ExecutorEvent>();
    let mut all_completed = true;
    for sql in &cli.sql {
        let request = ExecutionRequest::new(CLI_SOURCE_ID, Arc::clone(&connection), sql.clone());
        let unique_id = request.unique_id().to_string();
        executor.submit(request, tx.clone())?;

        while let Some(event) = rx.recv().await {
            print_event(&event, cli.json)?;
            if event.is_terminal() && event.response().unique_id() == unique_id {
                if event.kind() == EventKind::Completed {
                    if !cli.json {
                        print_table(event.response().table());
                    }
                } else {
                    all_completed = false;
                }
                break;
            }
        }
    }

    executor.close().await?;
    registry.close_all().await;
    Ok(all_completed)
}

/// Resolves the connection to use, with its id.
///
/// Precedence: CLI arguments, named connection from config, default
/// connection from config. Environment variables fill in what is missing.
fn resolve_connection(cli: &Cli, config: &Config) -> anyhow::Result<Option<(String, ConnectionConfig)>> {
    let mut connection = cli
        .to_connection_config()?
        .map(|conn| (CLI_SOURCE_ID.to_string(), conn));

    if connection.is_none() {
        if let Some(name) = cli.connection_name() {
            let conn = config
                .get_connection(Some(name))
                .cloned()
                .with_context(|| format!("Connection '{name}' not found in config file"))?;
            connection = Some((name.to_string(), conn));
        }
    }

    if connection.is_none() {
        connection = config
            .get_connection(None)
            .cloned()
            .map(|conn| ("default".to_string(), conn));
    }

    if let Some((_, conn)) = connection.as_mut() {
        conn.apply_env_defaults();
    }

    Ok(connection)
}

fn print_event(event: &ExecutorEvent, json: bool) -> anyhow::Result<()> {
    let summary = event.summary();
    if json {
        println!("{}", serde_json::to_string(&summary)?);
        return Ok(());
    }

    let mut line = format!(
        "{:<17} [{}] rows={} total={}ms exec={}ms fetch={}ms",
        summary.kind.as_str(),
        summary.unique_id,
        summary.rows,
        summary.total_ms,
        summary.exec_ms,
        summary.fetch_ms
    );
    if let Some(error) = &summary.error {
        line.push_str(&format!(" error: {error}"));
    }
    println!("{line}");
    Ok(())
}

fn print_table(table: &ResultTable) {
    let Some(columns) = table.column_names() else {
        return;
    };
    println!("{}", columns.join(" | "));
    for row in table.rows(0..table.size()) {
        let values: Vec<String> = row.values().iter().map(|v| v.to_display_string()).collect();
        println!("{}", values.join(" | "));
    }
}

fn report_check(
    registry: &ConnectionRegistry,
    lost: &[Arc<dyn Connection>],
    json: bool,
) -> anyhow::Result<()> {
    let lost_ids: Vec<&str> = lost.iter().map(|conn| conn.id()).collect();
    if json {
        let report = serde_json::json!({
            "check": {
                "connections": registry.ids(),
                "lost": lost_ids,
            }
        });
        println!("{report}");
    } else if lost_ids.is_empty() {
        println!("All {} connection(s) alive", registry.len());
    } else {
        warn!(lost = ?lost_ids, "Lost connections");
        println!("Lost connection(s): {}", lost_ids.join(", "));
    }
    Ok(())
}
