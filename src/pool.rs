//! Bounded resource pool: caps how many statements run against the database at once.
//!
//! Each [`PoolHandle`] owns one semaphore permit, one slot of the in-flight counter and one
//! driver connection. Dropping the handle gives all three back, so release happens on every
//! exit path including errors, `?` and task cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::{BenchError, Result};
use crate::stream::Scalar;

/// What a driver reports for one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub rows: u64,
    pub affected_rows: u64,
    /// Engine-reported cost, for drivers that bill per query.
    pub cost: Option<f64>,
    pub bytes_scanned: Option<u64>,
}

impl QueryOutput {
    fn absorb(&mut self, other: QueryOutput) {
        self.rows += other.rows;
        self.affected_rows += other.affected_rows;
        self.cost = sum_opt(self.cost, other.cost);
        self.bytes_scanned = sum_opt(self.bytes_scanned, other.bytes_scanned);
    }
}

fn sum_opt<T: std::ops::Add<Output = T>>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, None) => a,
        (None, b) => b,
    }
}

#[derive(Debug, Clone)]
pub struct TimedOutput {
    pub output: QueryOutput,
    /// From just before the statement was issued until its results were fully received.
    pub duration: Duration,
}

/// Opaque capability to open connections and run one statement on them.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection>;

    async fn execute(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        binds: &[Scalar],
    ) -> Result<QueryOutput>;
}

struct InFlightSlot(Arc<watch::Sender<usize>>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

/// Exclusive access to one connection. Field order matters: the counter slot is
/// released before the permit so `in_flight` never overshoots `capacity`.
pub struct PoolHandle<C> {
    conn: C,
    _slot: InFlightSlot,
    _permit: OwnedSemaphorePermit,
}

pub struct ResourcePool<D: Driver> {
    driver: D,
    capacity: usize,
    permits: Arc<Semaphore>,
    in_flight: Arc<watch::Sender<usize>>,
}

impl<D: Driver> ResourcePool<D> {
    pub fn new(driver: D, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BenchError::Config("pool capacity must be > 0".into()));
        }
        let (in_flight, _) = watch::channel(0usize);
        Ok(Self {
            driver,
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            in_flight: Arc::new(in_flight),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Wait for spare capacity, then check out a connection.
    pub async fn acquire(&self) -> Result<PoolHandle<D::Connection>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BenchError::Config("resource pool is closed".into()))?;
        self.in_flight.send_modify(|n| *n += 1);
        let slot = InFlightSlot(self.in_flight.clone());
        let conn = self.driver.connect().await?;
        Ok(PoolHandle {
            conn,
            _slot: slot,
            _permit: permit,
        })
    }

    pub async fn execute(
        &self,
        handle: &mut PoolHandle<D::Connection>,
        sql: &str,
        binds: &[Scalar],
    ) -> Result<TimedOutput> {
        let start = Instant::now();
        let output = self.driver.execute(&mut handle.conn, sql, binds).await?;
        Ok(TimedOutput {
            output,
            duration: start.elapsed(),
        })
    }

    /// Run statements one after another on the same connection, timing them as a unit.
    pub async fn execute_all(
        &self,
        handle: &mut PoolHandle<D::Connection>,
        statements: &[String],
        binds: &[Scalar],
    ) -> Result<TimedOutput> {
        let start = Instant::now();
        let mut total = QueryOutput::default();
        for sql in statements {
            let output = self.driver.execute(&mut handle.conn, sql, binds).await?;
            total.absorb(output);
        }
        Ok(TimedOutput {
            output: total,
            duration: start.elapsed(),
        })
    }

    pub fn release(&self, handle: PoolHandle<D::Connection>) {
        drop(handle);
    }

    /// Acquire, execute and release in one call.
    pub async fn run(&self, sql: &str, binds: &[Scalar]) -> Result<TimedOutput> {
        let mut handle = self.acquire().await?;
        let result = self.execute(&mut handle, sql, binds).await;
        self.release(handle);
        result
    }

    /// Suspend until nothing is in flight.
    pub async fn drain(&self) {
        let mut rx = self.in_flight.subscribe();
        // The sender lives in `self`, so the channel cannot close underneath us.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyDriver {
        fail_execute: AtomicBool,
    }

    #[async_trait]
    impl Driver for FlakyDriver {
        type Connection = ();

        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, _conn: &mut (), sql: &str, _binds: &[Scalar]) -> Result<QueryOutput> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_execute.load(Ordering::SeqCst) {
                return Err(BenchError::execution(format!("boom: {sql}")));
            }
            Ok(QueryOutput {
                rows: 1,
                affected_rows: 1,
                cost: Some(0.5),
                bytes_scanned: None,
            })
        }
    }

    fn pool(fail: bool) -> ResourcePool<FlakyDriver> {
        ResourcePool::new(
            FlakyDriver {
                fail_execute: AtomicBool::new(fail),
            },
            2,
        )
        .unwrap()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let driver = FlakyDriver {
            fail_execute: AtomicBool::new(false),
        };
        assert!(ResourcePool::new(driver, 0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_statement_time() {
        let pool = pool(false);
        let timed = pool.run("select 1", &[]).await.unwrap();
        assert_eq!(timed.duration, Duration::from_millis(10));
        assert_eq!(timed.output.rows, 1);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_execution_still_releases() {
        let pool = pool(true);
        assert!(pool.run("select 1", &[]).await.is_err());
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.permits.available_permits(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_all_sums_outputs() {
        let pool = pool(false);
        let mut handle = pool.acquire().await.unwrap();
        assert_eq!(pool.in_flight(), 1);
        let statements = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let timed = pool.execute_all(&mut handle, &statements, &[]).await.unwrap();
        pool.release(handle);
        assert_eq!(timed.duration, Duration::from_millis(30));
        assert_eq!(timed.output.rows, 3);
        assert_eq!(timed.output.cost, Some(1.5));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_held_handle() {
        let pool = Arc::new(pool(false));
        let handle = pool.acquire().await.unwrap();

        let drained = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!drained.is_finished());

        pool.release(handle);
        drained.await.unwrap();
        assert_eq!(pool.in_flight(), 0);
    }
}
