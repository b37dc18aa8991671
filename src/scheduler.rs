// Scheduler module - drives periodic refreshes of every collector
//
// One collection cycle borrows a single connection from the pool, opens a
// transaction, and refreshes each collector in the fixed order inside its
// own SAVEPOINT. A collector that fails (or panics) is logged and rolled
// back to its savepoint; the remaining collectors still run on a healthy
// transaction.
//
// # Lifecycle
// Uninitialized -> Initializing -> Running -> ShuttingDown -> Stopped
//
// - `initialize` registers the collectors and runs the first cycle
// - `run_forever` repeats cycles every `interval` until told to stop
// - `shutdown` closes the pool; it is safe to call more than once

use futures_util::FutureExt;
use prometheus::Registry;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::db::{Connection, ConnectionManager, Pool, PoolError};
use crate::metrics::{self, MetricCollector};

/// Delay before retrying after a cycle could not get a connection
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Observable lifecycle state of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

/// Result of refreshing a single collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorOutcome {
    Refreshed,
    Failed(String),
}

/// Per-collector outcomes of one cycle, in refresh order
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcomes: Vec<(&'static str, CollectorOutcome)>,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == CollectorOutcome::Refreshed)
            .count()
    }

    /// Names of the collectors that failed this cycle
    pub fn failed(&self) -> Vec<&'static str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, CollectorOutcome::Failed(_)))
            .map(|(name, _)| *name)
            .collect()
    }
}

/// Owns the collectors and the pool, and schedules refresh cycles
pub struct CollectorManager<M: ConnectionManager> {
    pool: Pool<M>,
    interval: Duration,
    retry_delay: Duration,
    collectors: Arc<Vec<Box<dyn MetricCollector>>>,
    state: watch::Sender<ManagerState>,
    /// Whether the most recent cycle obtained a connection
    healthy: AtomicBool,
}

impl<M: ConnectionManager> CollectorManager<M> {
    /// Creates a manager that has no collectors yet
    ///
    /// # Arguments
    /// * `pool` - Shared connection pool, closed by `shutdown`
    /// * `interval` - Pause between the end of one cycle and the next
    pub fn new(pool: Pool<M>, interval: Duration) -> Self {
        let (state, _) = watch::channel(ManagerState::Uninitialized);
        CollectorManager {
            pool,
            interval,
            retry_delay: RETRY_DELAY,
            collectors: Arc::new(Vec::new()),
            state,
            healthy: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ManagerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Collector manager state: {:?} -> {:?}", previous, state);
        }
    }

    /// Registers all domain collectors in `registry` and runs the first cycle
    ///
    /// A first cycle that cannot get a connection is logged and left to the
    /// collection loop to retry; only instrument registration errors fail
    /// initialization.
    pub async fn initialize(&mut self, registry: &Registry) -> Result<(), prometheus::Error> {
        self.set_state(ManagerState::Initializing);
        let collectors = metrics::create_all_collectors(registry)?;
        self.initialize_with(collectors).await;
        Ok(())
    }

    /// Same as `initialize`, with an explicit list of collectors
    pub async fn initialize_with(&mut self, collectors: Vec<Box<dyn MetricCollector>>) {
        self.set_state(ManagerState::Initializing);
        info!(
            "Initializing {} collector(s): {}",
            collectors.len(),
            collectors
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.collectors = Arc::new(collectors);

        if let Err(e) = self.run_cycle().await {
            warn!("Initial collection failed, the collection loop will retry: {}", e);
        }
        self.set_state(ManagerState::Running);
    }

    /// Runs one collection cycle on a single pooled connection
    ///
    /// # Returns
    /// * `Ok(CycleReport)` - The cycle ran; individual collectors may still
    ///   have failed (see the report)
    /// * `Err(PoolError)` - No connection could be borrowed, or the cycle's
    ///   transaction could not be opened or committed
    pub async fn run_cycle(&self) -> Result<CycleReport, PoolError> {
        let started = Instant::now();
        let collectors = Arc::clone(&self.collectors);

        let result = self
            .pool
            .scoped(move |conn| {
                Box::pin(async move {
                    let mut report = CycleReport::default();
                    for collector in collectors.iter() {
                        let outcome = refresh_guarded(&mut *conn, collector.as_ref()).await;
                        report.outcomes.push((collector.name(), outcome));
                    }
                    Ok::<_, PoolError>(report)
                })
            })
            .await;

        self.healthy.store(result.is_ok(), Ordering::SeqCst);
        debug!("Pool after cycle: {:?}", self.pool.status());

        if let Ok(report) = &result {
            let failed = report.failed();
            if failed.is_empty() {
                info!(
                    "Collection cycle finished: {} collector(s) refreshed in {:?}",
                    report.succeeded(),
                    started.elapsed()
                );
            } else {
                warn!(
                    "Collection cycle finished with failures in {:?}: {}/{} refreshed, failed: {}",
                    started.elapsed(),
                    report.succeeded(),
                    report.outcomes.len(),
                    failed.join(", ")
                );
            }
        }

        result
    }

    /// Runs collection cycles until `shutdown` turns true
    ///
    /// Cycles are spaced by the configured interval; a cycle that fails to
    /// get a connection is retried after the short retry delay instead.
    /// The signal interrupts the pause between cycles. On exit the manager
    /// is shut down.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting collection loop (every {:?}, retry after {:?})",
            self.interval, self.retry_delay
        );

        loop {
            let delay = if self.healthy.load(Ordering::SeqCst) {
                self.interval
            } else {
                self.retry_delay
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                // A dropped sender also ends the loop
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Shutdown requested, stopping collection loop");
                    break;
                }
            }

            if let Err(e) = self.run_cycle().await {
                error!(
                    "Collection cycle failed, retrying in {:?}: {}",
                    self.retry_delay, e
                );
            }
        }

        self.shutdown().await;
    }

    /// Closes the pool and moves to `Stopped`
    pub async fn shutdown(&self) {
        if matches!(self.state(), ManagerState::ShuttingDown | ManagerState::Stopped) {
            debug!("Collector manager already shutting down");
            return;
        }

        self.set_state(ManagerState::ShuttingDown);
        self.pool.close_all().await;
        self.set_state(ManagerState::Stopped);
        info!("Collector manager stopped");
    }
}

/// Refreshes one collector inside a savepoint, never propagating failure
///
/// Errors and panics are logged and turned into `CollectorOutcome::Failed`,
/// and the connection is rolled back to the savepoint so the next collector
/// starts from a usable transaction.
async fn refresh_guarded<C: Connection>(
    conn: &mut C,
    collector: &dyn MetricCollector,
) -> CollectorOutcome {
    let name = collector.name();

    if let Err(e) = conn.savepoint(name).await {
        error!("Skipping collector '{}': could not create savepoint: {}", name, e);
        return CollectorOutcome::Failed(format!("savepoint failed: {}", e));
    }

    let started = Instant::now();
    let result = AssertUnwindSafe(collector.refresh(&mut *conn))
        .catch_unwind()
        .await;

    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(panic) => Some(format!("panicked: {}", panic_message(&*panic))),
    };

    match failure {
        None => {
            debug!("Collector '{}' refreshed in {:?}", name, started.elapsed());
            if let Err(e) = conn.release_savepoint(name).await {
                // A skipped inner block left the transaction aborted
                debug!("Releasing savepoint '{}' failed, rolling back to it: {}", name, e);
                if let Err(e) = conn.rollback_to_savepoint(name).await {
                    warn!("Rollback to savepoint '{}' failed: {}", name, e);
                }
            }
            CollectorOutcome::Refreshed
        }
        Some(reason) => {
            error!("Failed to refresh collector '{}': {}", name, reason);
            if let Err(e) = conn.rollback_to_savepoint(name).await {
                warn!("Rollback to savepoint '{}' failed: {}", name, e);
            }
            CollectorOutcome::Failed(reason)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
