//! Bounded pool of destination sessions.
//!
//! The pool hands out at most `max_size` connections at once. A semaphore
//! gates borrowers; the idle queue and the created-count sit behind separate
//! locks and neither is held while the other is taken or across an `.await`.
//! Connections are created lazily up to the cap, probed before hand-out and
//! replaced transparently when the probe fails.

use super::{ConnectionFactory, DatabaseConnection, DbError};
use crate::dialect::Dialect;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

const IDLE_RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out after {0:?} waiting for a free connection")]
    Timeout(Duration),
    #[error("connection pool is closed")]
    Closed,
    #[error("failed to open connection: {0}")]
    Connect(#[source] DbError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_size: usize,
    /// Connections opened up front; capped at two and at `max_size`.
    pub initial_size: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 8,
            initial_size: 2,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub created: usize,
    pub idle: usize,
    pub borrowed: usize,
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    max_size: usize,
    acquire_timeout: Duration,
    idle: Mutex<VecDeque<F::Connection>>,
    created: Mutex<usize>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn reserve_slot(&self) -> bool {
        let mut created = self.created.lock();
        if *created < self.max_size {
            *created += 1;
            true
        } else {
            false
        }
    }

    fn forget_slot(&self) {
        let mut created = self.created.lock();
        *created = created.saturating_sub(1);
    }

    async fn open(&self) -> Result<F::Connection, PoolError> {
        self.factory.connect().await.map_err(PoolError::Connect)
    }

    fn release(&self, conn: F::Connection) {
        if !self.closed.load(Ordering::Acquire) {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_size {
                idle.push_back(conn);
                return;
            }
        }
        self.forget_slot();
        close_detached(conn);
    }
}

/// A counted slot whose connection is not yet handed out. Dropping the guard
/// (including when the `acquire` future is cancelled mid-await) gives the
/// slot back.
struct SlotGuard<'a, F: ConnectionFactory> {
    pool: &'a PoolInner<F>,
    armed: bool,
}

impl<'a, F: ConnectionFactory> SlotGuard<'a, F> {
    fn new(pool: &'a PoolInner<F>) -> Self {
        Self { pool, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for SlotGuard<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.forget_slot();
        }
    }
}

fn close_detached<C: DatabaseConnection>(conn: C) {
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(conn.close());
    }
}

/// Cloneable handle to a shared connection pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Build a pool and open its initial connections. Fails if any of them
    /// cannot be opened, so a misconfigured destination surfaces immediately.
    pub async fn new(factory: F, options: PoolOptions) -> Result<Self, PoolError> {
        let max_size = options.max_size.max(1);
        let pool = Self {
            inner: Arc::new(PoolInner {
                factory,
                max_size,
                acquire_timeout: options.acquire_timeout,
                idle: Mutex::new(VecDeque::with_capacity(max_size)),
                created: Mutex::new(0),
                permits: Arc::new(Semaphore::new(max_size)),
                closed: AtomicBool::new(false),
            }),
        };

        let initial = options.initial_size.min(2).min(max_size);
        for _ in 0..initial {
            if !pool.inner.reserve_slot() {
                break;
            }
            let slot = SlotGuard::new(&pool.inner);
            let conn = pool.inner.open().await?;
            slot.keep();
            pool.inner.idle.lock().push_back(conn);
        }

        log::debug!("connection pool ready: max_size={} initial={}", max_size, initial);
        Ok(pool)
    }

    /// Borrow a live connection, waiting up to the acquire timeout when every
    /// connection is already out.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let deadline = Instant::now() + self.inner.acquire_timeout;
        let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
            Err(TryAcquireError::NoPermits) => {
                let wait = Arc::clone(&self.inner.permits).acquire_owned();
                match tokio::time::timeout(self.inner.acquire_timeout, wait).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(PoolError::Closed),
                    Err(_) => return Err(PoolError::Timeout(self.inner.acquire_timeout)),
                }
            }
        };

        loop {
            let candidate = self.inner.idle.lock().pop_front();
            match candidate {
                Some(mut conn) => {
                    let slot = SlotGuard::new(&self.inner);
                    match conn.ping().await {
                        Ok(()) => {
                            slot.keep();
                            return Ok(PooledConnection::new(conn, permit, &self.inner));
                        }
                        Err(err) => {
                            log::debug!("discarding dead pooled connection: {}", err);
                            drop(conn);
                        }
                    }
                }
                None => {
                    if self.inner.reserve_slot() {
                        let slot = SlotGuard::new(&self.inner);
                        let conn = self.inner.open().await?;
                        slot.keep();
                        log::trace!("opened pooled connection: {:?}", self.status());
                        return Ok(PooledConnection::new(conn, permit, &self.inner));
                    }
                    // A returning connection has not reached the idle queue yet.
                    if Instant::now() >= deadline {
                        return Err(PoolError::Timeout(self.inner.acquire_timeout));
                    }
                    tokio::time::sleep(IDLE_RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Close every idle connection and refuse further borrows. Connections
    /// still borrowed are closed when their guards drop.
    pub async fn dispose_all(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();

        let drained: Vec<F::Connection> = self.inner.idle.lock().drain(..).collect();
        let count = drained.len();
        for conn in drained {
            self.inner.forget_slot();
            conn.close().await;
        }
        log::debug!("connection pool disposed: closed {} idle connections", count);
    }

    pub fn status(&self) -> PoolStatus {
        let created = *self.inner.created.lock();
        let idle = self.inner.idle.lock().len();
        let borrowed = if self.inner.closed.load(Ordering::Acquire) {
            created.saturating_sub(idle)
        } else {
            self.inner
                .max_size
                .saturating_sub(self.inner.permits.available_permits())
        };
        PoolStatus {
            max_size: self.inner.max_size,
            created,
            idle,
            borrowed,
        }
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.factory.dialect()
    }
}

/// Exclusive loan of one pooled connection; returned to the pool on drop.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<F::Connection>,
    pool: Arc<PoolInner<F>>,
    _permit: OwnedSemaphorePermit,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(conn: F::Connection, permit: OwnedSemaphorePermit, pool: &Arc<PoolInner<F>>) -> Self {
        Self {
            conn: Some(conn),
            pool: Arc::clone(pool),
            _permit: permit,
        }
    }

    /// Drop a connection known to be broken instead of returning it.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.forget_slot();
            close_detached(conn);
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("pooled connection is present until dropped")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection is present until dropped")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        // The permit field drops after this body, so the connection is back in
        // the idle queue before another borrower can start.
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;
    use crate::test_support::StubConnector;
    use std::sync::atomic::AtomicUsize;

    fn options(max_size: usize) -> PoolOptions {
        PoolOptions {
            max_size,
            initial_size: 2,
            acquire_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_eager_connections_capped_at_two() {
        let connector = StubConnector::new(Dialect::Postgres);
        let pool = ConnectionPool::new(connector.clone(), options(6)).await.unwrap();

        assert_eq!(connector.connect_count(), 2);
        let status = pool.status();
        assert_eq!(status.created, 2);
        assert_eq!(status.idle, 2);
        assert_eq!(status.borrowed, 0);

        let small = ConnectionPool::new(StubConnector::new(Dialect::Doris), options(1))
            .await
            .unwrap();
        assert_eq!(small.status().created, 1);
    }

    #[tokio::test]
    async fn test_grows_lazily_up_to_max() {
        let connector = StubConnector::new(Dialect::Postgres);
        let pool = ConnectionPool::new(connector.clone(), options(3)).await.unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(connector.connect_count(), 2);
        let c = pool.acquire().await.unwrap();
        assert_eq!(connector.connect_count(), 3);
        assert_eq!(pool.status().borrowed, 3);

        drop((a, b, c));
        let status = pool.status();
        assert_eq!(status.idle, 3);
        assert_eq!(status.borrowed, 0);

        let _again = pool.acquire().await.unwrap();
        assert_eq!(connector.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let pool = ConnectionPool::new(StubConnector::new(Dialect::Postgres), options(1))
            .await
            .unwrap();

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().expect("second borrow must fail");
        assert!(matches!(err, PoolError::Timeout(_)));

        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_waiting_borrower_gets_released_connection() {
        let pool = ConnectionPool::new(StubConnector::new(Dialect::Postgres), options(1))
            .await
            .unwrap();
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_dead_connection_replaced_transparently() {
        let connector = StubConnector::new(Dialect::Postgres);
        let pool = ConnectionPool::new(connector.clone(), options(2)).await.unwrap();

        connector.fail_next_pings(2);
        let mut conn = pool.acquire().await.unwrap();
        assert!(conn.ping().await.is_ok());
        assert_eq!(connector.connect_count(), 3);
        assert_eq!(pool.status().created, 1);
    }

    #[tokio::test]
    async fn test_initial_connect_failure_fails_fast() {
        let connector = StubConnector::new(Dialect::Doris);
        connector.fail_connections(true);

        let err = ConnectionPool::new(connector, options(4)).await.err();
        assert!(matches!(err, Some(PoolError::Connect(_))));
    }

    #[tokio::test]
    async fn test_connect_failure_releases_slot() {
        let connector = StubConnector::new(Dialect::Postgres);
        let pool = ConnectionPool::new(
            connector.clone(),
            PoolOptions {
                initial_size: 0,
                ..options(2)
            },
        )
        .await
        .unwrap();

        connector.fail_connections(true);
        assert!(matches!(pool.acquire().await, Err(PoolError::Connect(_))));
        assert_eq!(pool.status().created, 0);

        connector.fail_connections(false);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_connect_releases_slot() {
        let connector = StubConnector::new(Dialect::Postgres);
        let pool = ConnectionPool::new(
            connector.clone(),
            PoolOptions {
                initial_size: 0,
                ..options(2)
            },
        )
        .await
        .unwrap();

        connector.set_connect_delay(Duration::from_millis(500));
        for _ in 0..2 {
            let cut_short = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
            assert!(cut_short.is_err());
        }
        assert_eq!(pool.status().created, 0);

        connector.set_connect_delay(Duration::ZERO);
        let conn = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .expect("acquire must not hang after cancelled connects");
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_ping_releases_slot() {
        let connector = StubConnector::new(Dialect::Postgres);
        let pool = ConnectionPool::new(connector.clone(), options(1)).await.unwrap();

        connector.set_ping_delay(Duration::from_millis(500));
        let cut_short = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(cut_short.is_err());
        assert_eq!(pool.status().created, 0);

        connector.set_ping_delay(Duration::ZERO);
        assert!(pool.acquire().await.is_ok());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_discard_drops_connection() {
        let connector = StubConnector::new(Dialect::Postgres);
        let pool = ConnectionPool::new(connector.clone(), options(2)).await.unwrap();

        let conn = pool.acquire().await.unwrap();
        conn.discard();
        let status = pool.status();
        assert_eq!(status.created, 1);
        assert_eq!(status.idle, 1);
        assert_eq!(status.borrowed, 0);
    }

    #[tokio::test]
    async fn test_dispose_all_closes_idle_and_rejects_borrows() {
        let connector = StubConnector::new(Dialect::Postgres);
        let pool = ConnectionPool::new(connector.clone(), options(3)).await.unwrap();
        let held = pool.acquire().await.unwrap();

        pool.dispose_all().await;
        assert_eq!(connector.close_count(), 1);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));

        drop(held);
        tokio::task::yield_now().await;
        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.status().created, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_more_than_max_borrowed() {
        const POOL_SIZE: usize = 3;
        let connector = StubConnector::new(Dialect::Postgres);
        let pool = ConnectionPool::new(
            connector.clone(),
            PoolOptions {
                acquire_timeout: Duration::from_secs(10),
                ..options(POOL_SIZE)
            },
        )
        .await
        .unwrap();

        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let conn = pool.acquire().await.unwrap();
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_use.fetch_sub(1, Ordering::SeqCst);
                    drop(conn);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= POOL_SIZE);
        assert!(connector.connect_count() <= POOL_SIZE);
        assert_eq!(pool.status().borrowed, 0);
    }
}
