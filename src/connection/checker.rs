//! Background liveness checking of open connections.
//!
//! Every period the checker probes all the open connections it is given,
//! concurrently and each within a bounded time. Connections found dead are
//! closed and reported to a handler as soon as they are found, so one slow
//! probe does not hold back the others.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::CheckerConfig;
use crate::db::Connection;
use crate::error::{QuestError, Result};

type Supplier = dyn Fn() -> Vec<Arc<dyn Connection>> + Send + Sync;
type Handler = dyn Fn(Vec<Arc<dyn Connection>>) + Send + Sync;

/// Result of probing one connection.
enum Verdict {
    Valid,
    Invalid,
    TimedOut,
    Indeterminate(QuestError),
}

struct Shared {
    supplier: Box<Supplier>,
    handler: Box<Handler>,
    config: CheckerConfig,
    checking: AtomicBool,
}

/// Clears the in-cycle flag however the cycle ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Shared {
    /// Runs one check cycle, unless one is already running.
    ///
    /// Returns every connection found lost during the cycle, or `None` when
    /// the cycle was skipped.
    async fn run_cycle(&self, cancel: &CancellationToken) -> Option<Vec<Arc<dyn Connection>>> {
        if self
            .checking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Previous check cycle still running, skipping");
            return None;
        }
        let _guard = CycleGuard(&self.checking);

        let open: Vec<Arc<dyn Connection>> = (self.supplier)()
            .into_iter()
            .filter(|conn| conn.is_open())
            .collect();
        if open.is_empty() {
            return Some(Vec::new());
        }
        debug!(connections = open.len(), "Checking connections");

        let timeout = self.config.probe_timeout();
        let mut probes = JoinSet::new();
        for conn in open {
            probes.spawn(async move {
                let verdict = match tokio::time::timeout(timeout, conn.is_valid()).await {
                    Ok(Ok(true)) => Verdict::Valid,
                    Ok(Ok(false)) => Verdict::Invalid,
                    Ok(Err(e)) => Verdict::Indeterminate(e),
                    Err(_) => Verdict::TimedOut,
                };
                (conn, verdict)
            });
        }

        let mut lost = Vec::new();
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    probes.abort_all();
                    break;
                }
                joined = probes.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let mut found = Vec::new();
            self.classify(joined, &mut found).await;
            while let Some(joined) = probes.try_join_next() {
                self.classify(joined, &mut found).await;
            }
            if !found.is_empty() {
                lost.extend(found.iter().cloned());
                (self.handler)(found);
            }
        }
        Some(lost)
    }

    async fn classify(
        &self,
        joined: std::result::Result<(Arc<dyn Connection>, Verdict), JoinError>,
        found: &mut Vec<Arc<dyn Connection>>,
    ) {
        let (conn, verdict) = match joined {
            Ok(probed) => probed,
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(error = %e, "Connection probe panicked");
                }
                return;
            }
        };
        let lost = match verdict {
            Verdict::Valid => false,
            Verdict::Invalid => true,
            Verdict::TimedOut => {
                warn!(
                    connection = conn.id(),
                    timeout_secs = self.config.probe_timeout_secs,
                    "Connection probe timed out"
                );
                true
            }
            Verdict::Indeterminate(e) => {
                warn!(connection = conn.id(), error = %e, "Connection probe failed, will retry");
                false
            }
        };
        if lost {
            if let Err(e) = conn.close().await {
                warn!(connection = conn.id(), error = %e, "Failed to close lost connection");
            }
            found.push(conn);
        }
    }
}

struct Schedule {
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Periodically verifies the open connections handed out by a supplier.
pub struct ConnectionLivenessChecker {
    shared: Arc<Shared>,
    schedule: Mutex<Option<Schedule>>,
}

impl ConnectionLivenessChecker {
    /// `supplier` lists the connections to check, only the open ones are
    /// probed. `handler` receives the lost connections, possibly several
    /// times per cycle.
    pub fn new<S, H>(supplier: S, handler: H, config: CheckerConfig) -> Self
    where
        S: Fn() -> Vec<Arc<dyn Connection>> + Send + Sync + 'static,
        H: Fn(Vec<Arc<dyn Connection>>) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                supplier: Box::new(supplier),
                handler: Box::new(handler),
                config,
                checking: AtomicBool::new(false),
            }),
            schedule: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.schedule.lock().is_some()
    }

    /// Schedules the periodic check. Does nothing if already running.
    pub fn start(&self) -> Result<()> {
        let handle = Handle::try_current().map_err(|_| {
            QuestError::lifecycle("liveness checker must be started from within a tokio runtime")
        })?;

        let mut schedule = self.schedule.lock();
        if schedule.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn_on(
            run_schedule(Arc::clone(&self.shared), cancel.clone(), tasks.clone()),
            &handle,
        );
        info!(
            period_secs = self.shared.config.period_secs,
            "Connection liveness check started"
        );
        *schedule = Some(Schedule { cancel, tasks });
        Ok(())
    }

    /// Runs a check cycle right away, skipped if one is already running.
    pub async fn check_now(&self) -> Option<Vec<Arc<dyn Connection>>> {
        let cancel = self
            .schedule
            .lock()
            .as_ref()
            .map(|schedule| schedule.cancel.child_token())
            .unwrap_or_default();
        self.shared.run_cycle(&cancel).await
    }

    /// Stops the schedule and aborts in-flight probes, waiting briefly for them.
    pub async fn close(&self) {
        let schedule = self.schedule.lock().take();
        let Some(schedule) = schedule else {
            return;
        };
        schedule.cancel.cancel();
        schedule.tasks.close();

        let grace = self.shared.config.shutdown_grace();
        if tokio::time::timeout(grace, schedule.tasks.wait()).await.is_err() {
            warn!("Connection checks still running after shutdown grace period");
        }
        info!("Connection liveness check stopped");
    }
}

impl Drop for ConnectionLivenessChecker {
    fn drop(&mut self) {
        if let Some(schedule) = self.schedule.get_mut().take() {
            schedule.cancel.cancel();
        }
    }
}

/// Fires a cycle every period; cycles run as their own tasks so that a slow
/// one makes the following ticks skip instead of delaying the schedule.
async fn run_schedule(shared: Arc<Shared>, cancel: CancellationToken, tasks: TaskTracker) {
    let period = shared.config.period().max(std::time::Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            shared.run_cycle(&cancel).await;
        });
    }
}
