//! Asynchronous SQL execution with per-source single flight.
//!
//! The executor runs at most one execution per source at a time, streams
//! results into a shared [`ResultTable`] in growing batches and reports
//! progress through [`ExecutorEvent`]s. Submitting a request for a source
//! that still has one in flight cancels the older one first.

use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::request::{EventListener, ExecutionRequest, ExecutionResponse, ExecutorEvent};
use super::table::{ResultTable, STATUS_OK};
use crate::config::ExecutorConfig;
use crate::db::{RowCursor, StatementOutcome};
use crate::error::{QuestError, Result};

/// Batch sizing for RESULTS_AVAILABLE events.
///
/// Starts small so the first rows show up quickly, then doubles after every
/// batch up to a maximum, bounding the event rate for large result sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    current: usize,
    max: usize,
}

impl BatchPolicy {
    pub fn new(start: usize, max: usize) -> Self {
        let start = start.max(1);
        Self {
            current: start,
            max: max.max(start),
        }
    }

    /// Size of the batch being filled.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Returns true when `row_count` closes the current batch, in which case
    /// the next batch is twice as large (capped).
    pub fn reached(&mut self, row_count: usize) -> bool {
        if row_count == 0 || row_count % self.current != 0 {
            return false;
        }
        self.current = self.current.saturating_mul(2).min(self.max);
        true
    }
}

impl From<&ExecutorConfig> for BatchPolicy {
    fn from(config: &ExecutorConfig) -> Self {
        Self::new(config.start_batch_size, config.max_batch_size)
    }
}

/// Delivers the events of one execution, at most one of them terminal.
///
/// Shared by the worker and the canceller; whoever gets the first terminal
/// event through owns it. Reentrant so that a listener may cancel the very
/// execution it is being notified about.
struct Emitter {
    listener: Arc<dyn EventListener>,
    closed: ReentrantMutex<Cell<bool>>,
}

impl Emitter {
    fn new(listener: Arc<dyn EventListener>) -> Self {
        Self {
            listener,
            closed: ReentrantMutex::new(Cell::new(false)),
        }
    }

    /// Returns false if the event was dropped because the execution already ended.
    fn emit(&self, event: ExecutorEvent) -> bool {
        let closed = self.closed.lock();
        if closed.get() {
            return false;
        }
        if event.is_terminal() {
            closed.set(true);
        }
        self.listener.on_event(event);
        true
    }
}

/// Bookkeeping of an execution that has not reached its terminal event.
struct TrackedExecution {
    request: ExecutionRequest,
    table: Arc<ResultTable>,
    cancel: CancellationToken,
    emitter: Arc<Emitter>,
}

impl TrackedExecution {
    /// Interrupts the worker and reports CANCELLED, unless it already finished.
    fn cancel(self, reason: &str) {
        self.cancel.cancel();
        let response = ExecutionResponse::new(self.request, self.table, 0, 0, 0)
            .with_error(QuestError::cancelled(reason));
        let unique_id = response.unique_id().to_string();
        if self.emitter.emit(ExecutorEvent::Cancelled(response)) {
            info!(unique_id = %unique_id, reason, "Execution cancelled");
        }
    }
}

type Tracked = Arc<Mutex<HashMap<String, TrackedExecution>>>;

/// Removes the entry for the request's source, only if it is still this request.
fn untrack(tracked: &Tracked, request: &ExecutionRequest) {
    let mut map = tracked.lock();
    let owned = map
        .get(request.source_id())
        .is_some_and(|t| t.request.unique_id() == request.unique_id());
    if owned {
        map.remove(request.source_id());
    }
}

/// Resources that exist only while the executor is running.
struct Pool {
    handle: Handle,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Runs SQL executions, one per source at a time.
pub struct QueryExecutor {
    config: ExecutorConfig,
    pool: Mutex<Option<Pool>>,
    tracked: Tracked,
}

impl QueryExecutor {
    /// Creates a stopped executor.
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(None),
            tracked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Allocates the worker pool on the current tokio runtime.
    pub fn start(&self) -> Result<()> {
        let handle = Handle::try_current().map_err(|_| {
            QuestError::lifecycle("executor must be started from within a tokio runtime")
        })?;

        let mut pool = self.pool.lock();
        if pool.is_some() {
            return Err(QuestError::lifecycle("executor already started"));
        }
        let workers = self.config.workers.max(1);
        *pool = Some(Pool {
            handle,
            permits: Arc::new(Semaphore::new(workers)),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });
        info!(workers, "Query executor started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.pool.lock().is_some()
    }

    /// Number of executions that have not reached their terminal event.
    pub fn in_flight(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Schedules the request, cancelling the one in flight for the same source.
    ///
    /// Every outcome of the execution, failures included, is reported to
    /// `listener`; only lifecycle misuse is returned here.
    pub fn submit<L: EventListener>(&self, request: ExecutionRequest, listener: L) -> Result<()> {
        let submitted = Instant::now();

        let preempted = {
            let pool = self.pool.lock();
            if pool.is_none() {
                return Err(QuestError::lifecycle("executor is not started"));
            }
            self.tracked.lock().remove(request.source_id())
        };
        if let Some(previous) = preempted {
            previous.cancel("preempted by a newer request");
        }

        let raced = {
            let guard = self.pool.lock();
            let Some(pool) = guard.as_ref() else {
                return Err(QuestError::lifecycle("executor was closed during submission"));
            };

            let table = Arc::new(ResultTable::new(request.unique_id()));
            let cancel = pool.shutdown.child_token();
            let emitter = Arc::new(Emitter::new(Arc::new(listener)));

            let raced = self.tracked.lock().insert(
                request.source_id().to_string(),
                TrackedExecution {
                    request: request.clone(),
                    table: Arc::clone(&table),
                    cancel: cancel.clone(),
                    emitter: Arc::clone(&emitter),
                },
            );

            info!(
                source_id = request.source_id(),
                unique_id = request.unique_id(),
                connection = request.connection().id(),
                sql = request.sql(),
                "Submitting execution"
            );

            let worker = Worker {
                request,
                table,
                emitter,
                cancel,
                tracked: Arc::clone(&self.tracked),
                query_timeout: self.config.query_timeout(),
                batch: BatchPolicy::from(&self.config),
                submitted,
                execution_ms: 0,
                fetch_ms: 0,
            };
            pool.tasks
                .spawn_on(worker.run(Arc::clone(&pool.permits)), &pool.handle);
            raced
        };

        if let Some(racer) = raced {
            racer.cancel("preempted by a concurrent request");
        }
        Ok(())
    }

    /// Cancels the execution in flight for the request's source, if any.
    ///
    /// A CANCELLED event is emitted for it unless it already ended. Cancelling
    /// a source with nothing in flight does nothing.
    pub fn cancel_existing_request(&self, request: &ExecutionRequest) -> Result<()> {
        let existing = {
            let pool = self.pool.lock();
            if pool.is_none() {
                return Err(QuestError::lifecycle("executor is not started"));
            }
            self.tracked.lock().remove(request.source_id())
        };
        match existing {
            Some(tracked) => tracked.cancel("cancelled by request"),
            None => debug!(
                source_id = request.source_id(),
                "Nothing to cancel"
            ),
        }
        Ok(())
    }

    /// Cancels everything in flight and releases the worker pool.
    ///
    /// Waits up to the configured grace period for the workers to wind down.
    pub async fn close(&self) -> Result<()> {
        let (pool, in_flight) = {
            let mut pool = self.pool.lock();
            let Some(taken) = pool.take() else {
                return Err(QuestError::lifecycle("executor is not started"));
            };
            let in_flight: Vec<TrackedExecution> =
                self.tracked.lock().drain().map(|(_, t)| t).collect();
            (taken, in_flight)
        };

        for tracked in in_flight {
            tracked.cancel("executor closed");
        }
        pool.shutdown.cancel();
        pool.permits.close();
        pool.tasks.close();

        let grace = self.config.shutdown_grace();
        if tokio::time::timeout(grace, pool.tasks.wait()).await.is_err() {
            warn!(
                remaining = pool.tasks.len(),
                grace_ms = grace.as_millis() as u64,
                "Workers still running after shutdown grace period"
            );
        }
        info!("Query executor stopped");
        Ok(())
    }
}

impl Drop for QueryExecutor {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.get_mut().take() {
            pool.shutdown.cancel();
            pool.tasks.close();
        }
    }
}

/// How an execution ended, as seen by its worker.
enum Outcome {
    Completed,
    Failed(QuestError),
    Interrupted,
}

/// Awaits `fut` unless `cancel` fires first.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = fut => Some(output),
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

struct Worker {
    request: ExecutionRequest,
    table: Arc<ResultTable>,
    emitter: Arc<Emitter>,
    cancel: CancellationToken,
    tracked: Tracked,
    query_timeout: Duration,
    batch: BatchPolicy,
    submitted: Instant,
    execution_ms: u64,
    fetch_ms: u64,
}

impl Worker {
    async fn run(mut self, permits: Arc<Semaphore>) {
        let permit = match cancellable(&self.cancel, permits.acquire_owned()).await {
            Some(Ok(permit)) => permit,
            // Cancelled while queued, or the pool is gone.
            _ => {
                untrack(&self.tracked, &self.request);
                return;
            }
        };

        let outcome = self.execute().await;
        // Held until the terminal event went out, so the next execution of
        // this source cannot start ahead of it.
        self.finish(outcome);
        drop(permit);
    }

    fn response(&self) -> ExecutionResponse {
        ExecutionResponse::new(
            self.request.clone(),
            Arc::clone(&self.table),
            millis(self.submitted.elapsed()),
            self.execution_ms,
            self.fetch_ms,
        )
    }

    async fn execute(&mut self) -> Outcome {
        let connection = Arc::clone(self.request.connection());

        let valid = match cancellable(&self.cancel, connection.is_valid()).await {
            None => return Outcome::Interrupted,
            Some(Ok(valid)) => valid,
            Some(Err(e)) => {
                warn!(connection = connection.id(), error = %e, "Validity check failed");
                false
            }
        };
        if !valid {
            return Outcome::Failed(QuestError::connection(format!(
                "Connection [{}] is not valid",
                connection.id()
            )));
        }

        self.emitter.emit(ExecutorEvent::Started(self.response()));

        let execute_start = Instant::now();
        let result = cancellable(
            &self.cancel,
            connection.execute(self.request.sql(), self.query_timeout),
        )
        .await;
        self.execution_ms = millis(execute_start.elapsed());

        match result {
            None => Outcome::Interrupted,
            Some(Err(e)) => Outcome::Failed(e),
            Some(Ok(StatementOutcome::Update { rows_affected })) => {
                debug!(unique_id = self.request.unique_id(), rows_affected, "Statement applied");
                self.table.set_status(STATUS_OK);
                Outcome::Completed
            }
            Some(Ok(StatementOutcome::ResultSet(mut cursor))) => {
                self.fetch(cursor.as_mut()).await
            }
        }
    }

    async fn fetch(&mut self, cursor: &mut dyn RowCursor) -> Outcome {
        if cursor.columns().is_empty() {
            self.table.set_status(STATUS_OK);
            return Outcome::Completed;
        }
        if let Err(e) = self.table.set_column_metadata(cursor.columns()) {
            return Outcome::Failed(e);
        }

        let fetch_start = Instant::now();
        loop {
            let next = cancellable(&self.cancel, cursor.next_row()).await;
            self.fetch_ms = millis(fetch_start.elapsed());

            let values = match next {
                None => return Outcome::Interrupted,
                Some(Ok(Some(values))) => values,
                Some(Ok(None)) => return Outcome::Completed,
                Some(Err(e)) => return Outcome::Failed(e),
            };
            let row_count = match self.table.append_row(values) {
                Ok(index) => index + 1,
                Err(e) => return Outcome::Failed(e),
            };
            if self.batch.reached(row_count) {
                debug!(
                    unique_id = self.request.unique_id(),
                    rows = row_count,
                    next_batch = self.batch.current(),
                    "Results available"
                );
                self.emitter
                    .emit(ExecutorEvent::ResultsAvailable(self.response()));
            }
        }
    }

    fn finish(self, outcome: Outcome) {
        untrack(&self.tracked, &self.request);
        let response = self.response();
        match outcome {
            Outcome::Completed => {
                info!(
                    unique_id = self.request.unique_id(),
                    rows = self.table.size(),
                    total_ms = response.total_elapsed_ms,
                    exec_ms = self.execution_ms,
                    fetch_ms = self.fetch_ms,
                    "Execution completed"
                );
                self.emitter.emit(ExecutorEvent::Completed(response));
            }
            Outcome::Failed(e) => {
                error!(
                    unique_id = self.request.unique_id(),
                    source_id = self.request.source_id(),
                    error = %e,
                    "Execution failed"
                );
                self.emitter
                    .emit(ExecutorEvent::Failure(response.with_error(e)));
            }
            Outcome::Interrupted => {
                debug!(unique_id = self.request.unique_id(), "Execution interrupted");
            }
        }
    }
}
