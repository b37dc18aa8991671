// Connection pool - bounded lending of database connections
//
// The pool owns every physical connection. Callers borrow one through a
// `PooledConnection` handle, which returns it on drop, or through
// `Pool::scoped`, which additionally wraps the borrow in a transaction
// that commits on success and rolls back on error.
//
// # Invariants
// - At most `max_connections` handles exist at any time (semaphore permits)
// - Every handle gives its permit back exactly once, on drop
// - A connection is only recycled when it is known to be outside a
//   transaction and healthy; otherwise it is discarded

use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Connection, ConnectionManager, StoreError};

/// Errors that can occur while borrowing or managing connections
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Invalid pool bounds: min={min}, max={max}")]
    InvalidBounds { min: usize, max: usize },

    #[error("Failed to open database connection: {0}")]
    Connect(#[source] StoreError),

    #[error("Timed out after {0:?} waiting for a connection")]
    Timeout(Duration),

    #[error("Connection pool is closed")]
    Closed,

    #[error("Transaction control failed: {0}")]
    Transaction(#[source] StoreError),
}

/// Sizing and waiting policy for the pool
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Connections opened eagerly by `Pool::connect`
    pub min_connections: usize,

    /// Upper bound on connections lent out at the same time
    pub max_connections: usize,

    /// Deadline for the whole of `acquire`: waiting for a slot, pinging an
    /// idle connection and opening a new one
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            min_connections: 5,
            max_connections: 20,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of pool usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max: usize,
    /// Handles currently held by callers
    pub lent: usize,
    /// Open connections waiting to be reused
    pub idle: usize,
    /// Handles that could be acquired right now without waiting
    pub available: usize,
}

struct Shared<M: ConnectionManager> {
    manager: M,
    options: PoolOptions,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<M::Connection>>,
    closed: AtomicBool,
}

impl<M: ConnectionManager> Shared<M> {
    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<M::Connection>> {
        // The idle list stays consistent even if a holder panicked
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded pool of connections produced by a `ConnectionManager`
///
/// Cloning is cheap and every clone refers to the same pool. The process
/// builds exactly one pool at startup and hands clones to whoever needs it.
pub struct Pool<M: ConnectionManager> {
    shared: Arc<Shared<M>>,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Pool {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ConnectionManager> Pool<M> {
    /// Creates the pool and opens `min_connections` connections up front
    ///
    /// # Returns
    /// * `Ok(Pool)` - All eager connections were opened
    /// * `Err(PoolError)` - Invalid bounds, or the database is unreachable /
    ///   rejected the credentials
    pub async fn connect(manager: M, options: PoolOptions) -> Result<Self, PoolError> {
        if options.max_connections == 0 || options.min_connections > options.max_connections {
            return Err(PoolError::InvalidBounds {
                min: options.min_connections,
                max: options.max_connections,
            });
        }

        let mut idle = VecDeque::with_capacity(options.max_connections);
        for _ in 0..options.min_connections {
            let conn = manager.connect().await.map_err(PoolError::Connect)?;
            idle.push_back(conn);
        }

        info!(
            "Initialized DB connection pool (min={}, max={})",
            options.min_connections, options.max_connections
        );

        Ok(Pool {
            shared: Arc::new(Shared {
                permits: Arc::new(Semaphore::new(options.max_connections)),
                manager,
                options,
                idle: Mutex::new(idle),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Borrows a connection, waiting while the pool is exhausted
    ///
    /// Idle connections are pinged before reuse; dead ones are dropped and a
    /// fresh connection is opened in their place.
    ///
    /// # Returns
    /// * `Ok(PooledConnection)` - Exclusive handle, returned to the pool on drop
    /// * `Err(PoolError::Timeout)` - No usable connection within `acquire_timeout`
    /// * `Err(PoolError::Closed)` - `close_all` has been called
    /// * `Err(PoolError::Connect)` - A new connection could not be opened
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let timeout = self.shared.options.acquire_timeout;
        let deadline = Instant::now() + timeout;
        let permit = match tokio::time::timeout_at(
            deadline,
            Arc::clone(&self.shared.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // The semaphore is only closed by close_all
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(PoolError::Timeout(timeout)),
        };

        loop {
            let candidate = self.shared.lock_idle().pop_front();
            let Some(mut conn) = candidate else {
                break;
            };

            match tokio::time::timeout_at(deadline, conn.ping()).await {
                Ok(Ok(())) => return Ok(PooledConnection::new(conn, permit, &self.shared)),
                Ok(Err(e)) => {
                    warn!("Discarding dead idle connection: {}", e);
                    drop(conn);
                }
                Err(_) => {
                    warn!("Discarding idle connection that did not answer a ping");
                    return Err(PoolError::Timeout(timeout));
                }
            }
        }

        debug!("No idle connection available, opening a new one");
        let conn = match tokio::time::timeout_at(deadline, self.shared.manager.connect()).await {
            Ok(result) => result.map_err(PoolError::Connect)?,
            Err(_) => return Err(PoolError::Timeout(timeout)),
        };

        Ok(PooledConnection::new(conn, permit, &self.shared))
    }

    /// Runs `f` on a borrowed connection inside a transaction
    ///
    /// The single exit path:
    /// 1. commits when `f` returns `Ok`
    /// 2. rolls back when `f` returns `Err`
    /// 3. returns the connection to the pool in every case, including when
    ///    commit or rollback themselves fail (the connection is then
    ///    discarded rather than recycled, and its slot freed)
    ///
    /// # Example
    /// ```
    /// let users = pool
    ///     .scoped(|conn| Box::pin(async move { conn.fetch_count(&Query::TotalUsers).await }))
    ///     .await?;
    /// ```
    pub async fn scoped<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut M::Connection) -> BoxFuture<'c, Result<T, E>> + Send,
        T: Send,
        E: From<PoolError> + std::fmt::Display + Send,
    {
        let mut handle = self.acquire().await?;
        handle.begin().await?;

        let outcome = f(&mut *handle).await;
        match outcome {
            Ok(value) => {
                handle.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = handle.rollback().await {
                    warn!(
                        "Rollback failed after error '{}': {}",
                        err, rollback_err
                    );
                }
                Err(err)
            }
        }
    }

    /// Closes every idle connection and refuses further borrows
    ///
    /// Safe to call more than once. Handles still lent out are closed when
    /// they come back instead of being recycled. Queries in flight on those
    /// handles are not interrupted.
    pub async fn close_all(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!("Connection pool already closed");
            return;
        }

        self.shared.permits.close();

        let drained: Vec<M::Connection> = self.shared.lock_idle().drain(..).collect();
        let count = drained.len();
        for conn in drained {
            if let Err(e) = conn.close().await {
                warn!("Error closing database connection: {}", e);
            }
        }

        info!("Closed all database connections ({} idle)", count);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PoolStatus {
        let max = self.shared.options.max_connections;
        let available = self.shared.permits.available_permits();
        PoolStatus {
            max,
            lent: max.saturating_sub(available),
            idle: self.shared.lock_idle().len(),
            available,
        }
    }
}

/// Exclusive handle to a pooled connection
///
/// Dereferences to the underlying connection. Dropping the handle hands
/// the connection back to the pool and frees its slot.
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    shared: Arc<Shared<M>>,
    in_transaction: bool,
    broken: bool,
    // Declared last so the connection is back in the idle list before the
    // slot becomes visible to other waiters
    _permit: OwnedSemaphorePermit,
}

impl<M: ConnectionManager> PooledConnection<M> {
    fn new(conn: M::Connection, permit: OwnedSemaphorePermit, shared: &Arc<Shared<M>>) -> Self {
        PooledConnection {
            conn: Some(conn),
            shared: Arc::clone(shared),
            in_transaction: false,
            broken: false,
            _permit: permit,
        }
    }

    pub async fn begin(&mut self) -> Result<(), PoolError> {
        match (**self).begin().await {
            Ok(()) => {
                self.in_transaction = true;
                Ok(())
            }
            Err(e) => {
                self.broken = true;
                Err(PoolError::Transaction(e))
            }
        }
    }

    pub async fn commit(&mut self) -> Result<(), PoolError> {
        let result = (**self).commit().await;
        self.in_transaction = false;
        result.map_err(|e| {
            self.broken = true;
            PoolError::Transaction(e)
        })
    }

    pub async fn rollback(&mut self) -> Result<(), PoolError> {
        let result = (**self).rollback().await;
        self.in_transaction = false;
        result.map_err(|e| {
            self.broken = true;
            PoolError::Transaction(e)
        })
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if self.broken || self.in_transaction {
            // An interrupted transaction is aborted server-side when the
            // connection goes away
            debug!("Discarding connection instead of returning it to the pool");
            return;
        }

        let mut idle = self.shared.lock_idle();
        if self.shared.closed.load(Ordering::SeqCst) {
            drop(idle);
            debug!("Pool closed, dropping returned connection");
            drop(conn);
        } else {
            idle.push_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Query, Store};
    use crate::testing::{FakeDatabase, FakeManager};
    use std::sync::atomic::Ordering;

    fn options(min: usize, max: usize) -> PoolOptions {
        PoolOptions {
            min_connections: min,
            max_connections: max,
            acquire_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_connect_opens_min_connections() {
        let db = FakeDatabase::new();
        let pool = Pool::connect(FakeManager::new(&db), options(3, 5))
            .await
            .unwrap();

        assert_eq!(db.opened.load(Ordering::SeqCst), 3);
        assert_eq!(
            pool.status(),
            PoolStatus {
                max: 5,
                lent: 0,
                idle: 3,
                available: 5
            }
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_bounds() {
        let db = FakeDatabase::new();
        let result = Pool::connect(FakeManager::new(&db), options(6, 5)).await;
        assert!(matches!(
            result,
            Err(PoolError::InvalidBounds { min: 6, max: 5 })
        ));

        let result = Pool::connect(FakeManager::new(&db), options(0, 0)).await;
        assert!(matches!(result, Err(PoolError::InvalidBounds { .. })));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let db = FakeDatabase::new();
        db.fail_connect.store(true, Ordering::SeqCst);
        let result = Pool::connect(FakeManager::new(&db), options(1, 2)).await;
        assert!(matches!(result, Err(PoolError::Connect(_))));
    }

    #[tokio::test]
    async fn test_concurrent_borrows_leave_pool_whole() {
        let db = FakeDatabase::new();
        db.set_count(Query::TotalUsers, 4);
        let pool = Pool::connect(FakeManager::new(&db), options(2, 4))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let mut conn = pool.acquire().await.unwrap();
                assert!(pool.status().lent <= 4);
                let count = conn.fetch_count(&Query::TotalUsers).await.unwrap();
                tokio::task::yield_now().await;
                count
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), 4);
        }

        let status = pool.status();
        assert_eq!(status.lent, 0);
        assert_eq!(status.available, 4);
        assert!(db.opened.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let db = FakeDatabase::new();
        let pool = Pool::connect(FakeManager::new(&db), options(1, 1))
            .await
            .unwrap();

        let held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::Timeout(_))));

        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_connect_times_out() {
        let db = FakeDatabase::new();
        let pool = Pool::connect(FakeManager::new(&db), options(0, 1))
            .await
            .unwrap();

        db.stall.store(true, Ordering::SeqCst);
        let result = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
            .await
            .unwrap();
        assert!(matches!(result, Err(PoolError::Timeout(_))));
        assert_eq!(pool.status().available, 1);

        db.stall.store(false, Ordering::SeqCst);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_ping_times_out() {
        let db = FakeDatabase::new();
        let pool = Pool::connect(FakeManager::new(&db), options(1, 1))
            .await
            .unwrap();

        db.stall.store(true, Ordering::SeqCst);
        let result = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
            .await
            .unwrap();
        assert!(matches!(result, Err(PoolError::Timeout(_))));

        // The unresponsive connection is not put back
        let status = pool.status();
        assert_eq!(status.idle, 0);
        assert_eq!(status.available, 1);
    }

    #[tokio::test]
    async fn test_scoped_commits_on_success() {
        let db = FakeDatabase::new();
        db.set_count(Query::TotalChats, 9);
        let pool = Pool::connect(FakeManager::new(&db), options(1, 2))
            .await
            .unwrap();

        let total: Result<i64, PoolError> = pool
            .scoped(|conn| {
                Box::pin(async move {
                    conn.fetch_count(&Query::TotalChats)
                        .await
                        .map_err(PoolError::Transaction)
                })
            })
            .await;

        assert_eq!(total.unwrap(), 9);
        assert_eq!(db.events(), vec!["begin", "commit"]);
        assert_eq!(pool.status().available, 2);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_scoped_error_rolls_back_and_returns_connection() {
        let db = FakeDatabase::new();
        db.fail(Query::TotalChats);
        let pool = Pool::connect(FakeManager::new(&db), options(1, 2))
            .await
            .unwrap();

        let result: Result<i64, PoolError> = pool
            .scoped(|conn| {
                Box::pin(async move {
                    conn.fetch_count(&Query::TotalChats)
                        .await
                        .map_err(PoolError::Transaction)
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(db.events(), vec!["begin", "rollback"]);
        let status = pool.status();
        assert_eq!(status.lent, 0);
        assert_eq!(status.available, 2);
        assert_eq!(status.idle, 1);
    }

    #[tokio::test]
    async fn test_failed_rollback_still_releases_slot() {
        let db = FakeDatabase::new();
        db.fail(Query::TotalChats);
        db.fail_rollback.store(true, Ordering::SeqCst);
        let pool = Pool::connect(FakeManager::new(&db), options(1, 1))
            .await
            .unwrap();

        let result: Result<i64, PoolError> = pool
            .scoped(|conn| {
                Box::pin(async move {
                    conn.fetch_count(&Query::TotalChats)
                        .await
                        .map_err(PoolError::Transaction)
                })
            })
            .await;

        assert!(result.is_err());
        let status = pool.status();
        assert_eq!(status.available, 1);
        // The connection with an unknown transaction state is not reused
        assert_eq!(status.idle, 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_commit_surfaces_error() {
        let db = FakeDatabase::new();
        db.fail_commit.store(true, Ordering::SeqCst);
        let pool = Pool::connect(FakeManager::new(&db), options(1, 1))
            .await
            .unwrap();

        let result: Result<(), PoolError> = pool
            .scoped(|_conn| Box::pin(async move { Ok(()) }))
            .await;

        assert!(matches!(result, Err(PoolError::Transaction(_))));
        assert_eq!(pool.status().available, 1);
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn test_handle_dropped_mid_transaction_is_discarded() {
        let db = FakeDatabase::new();
        let pool = Pool::connect(FakeManager::new(&db), options(1, 1))
            .await
            .unwrap();

        {
            let mut conn = pool.acquire().await.unwrap();
            conn.begin().await.unwrap();
        }

        assert_eq!(pool.status().available, 1);
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn test_dead_idle_connection_is_replaced() {
        let db = FakeDatabase::new();
        let pool = Pool::connect(FakeManager::new(&db), options(1, 1))
            .await
            .unwrap();

        db.fail_ping.store(true, Ordering::SeqCst);
        let conn = pool.acquire().await.unwrap();
        drop(conn);

        assert_eq!(db.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_all_is_idempotent() {
        let db = FakeDatabase::new();
        let pool = Pool::connect(FakeManager::new(&db), options(3, 3))
            .await
            .unwrap();

        pool.close_all().await;
        pool.close_all().await;

        assert!(pool.is_closed());
        assert_eq!(db.closed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.status().idle, 0);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn test_connection_returned_after_close_is_dropped() {
        let db = FakeDatabase::new();
        let pool = Pool::connect(FakeManager::new(&db), options(1, 2))
            .await
            .unwrap();

        let conn = pool.acquire().await.unwrap();
        pool.close_all().await;
        drop(conn);

        assert_eq!(pool.status().idle, 0);
    }
}
