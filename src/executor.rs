//! Retrying executor for a single scheduled query.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{signed_millis, QueryState, RunEpoch, StateBoard};
use crate::error::{BenchError, Result};
use crate::pool::{Driver, ResourcePool, TimedOutput};
use crate::report::{Aggregator, ExecutionRecord};
use crate::stream::ScheduledQuery;
use crate::templates::{fill_binds, one_line, Template, TemplateSet};

/// Failed attempts allowed for a whole run. Every query draws from the same budget.
///
/// An attempt reserves one unit before it reaches the database. A success hands the unit
/// back; a failure spends it. In-flight attempts therefore never outnumber the failures the
/// budget can still absorb, and once `total` failures are spent every waiter is turned away.
#[derive(Debug)]
pub struct RetryBudget {
    total: u32,
    failed: AtomicU32,
    units: Semaphore,
}

/// One reserved budget unit. Dropping it returns the unit.
#[must_use]
pub struct Reservation<'a> {
    budget: &'a RetryBudget,
    permit: SemaphorePermit<'a>,
}

impl Reservation<'_> {
    /// Turn the reservation into a spent failure. Errors once the last unit is spent.
    pub fn charge(self) -> Result<u32> {
        self.permit.forget();
        let failed = self.budget.failed.fetch_add(1, Ordering::SeqCst) + 1;
        if failed >= self.budget.total {
            self.budget.units.close();
            return Err(self.budget.exhausted());
        }
        Ok(self.budget.total - failed)
    }
}

impl RetryBudget {
    pub fn new(total: u32) -> Self {
        let units = Semaphore::new(total as usize);
        if total == 0 {
            units.close();
        }
        Self {
            total,
            failed: AtomicU32::new(0),
            units,
        }
    }

    /// Units not yet spent, including those held by in-flight attempts.
    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.failed.load(Ordering::SeqCst))
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn check(&self) -> Result<()> {
        if self.is_exhausted() {
            return Err(self.exhausted());
        }
        Ok(())
    }

    /// Wait for a free unit. Fails as soon as the budget is exhausted.
    pub async fn reserve(&self) -> Result<Reservation<'_>> {
        let permit = self.units.acquire().await.map_err(|_| self.exhausted())?;
        Ok(Reservation {
            budget: self,
            permit,
        })
    }

    fn exhausted(&self) -> BenchError {
        BenchError::RetriesExhausted { budget: self.total }
    }
}

pub struct QueryRunner<D: Driver> {
    pub(crate) pool: Arc<ResourcePool<D>>,
    pub(crate) templates: Arc<TemplateSet>,
    pub(crate) budget: Arc<RetryBudget>,
    pub(crate) aggregator: Arc<Aggregator>,
    pub(crate) outstanding: Arc<AtomicUsize>,
    pub(crate) states: StateBoard,
    pub(crate) epoch: RunEpoch,
    pub(crate) execute_fragments: bool,
    pub(crate) retry_backoff: Duration,
}

impl<D: Driver> QueryRunner<D> {
    /// Execute `query` (retrying through the shared budget) and append its record.
    pub async fn run(&self, idx: usize, query: &ScheduledQuery) -> Result<ExecutionRecord> {
        let planned_start = self.epoch.planned_start(query.start_offset_ms);
        let actual_start = Instant::now();
        let start_delay_ms = signed_millis(actual_start, planned_start);
        self.states.set(idx, QueryState::Running);

        let result = self.run_with_retries(idx, query).await;
        let timed = match result {
            Ok(timed) => timed,
            Err(err) => {
                self.states.set(idx, QueryState::Fatal);
                return Err(err);
            }
        };

        let done = Instant::now();
        let record = ExecutionRecord {
            index: idx,
            query_id: query.query_id,
            actual_start_ts: self.epoch.unix_ms_at(actual_start),
            relative_start_ms: self.epoch.millis_since(actual_start),
            query_duration_ms: timed.duration.as_millis() as u64,
            query_duration_with_queue_ms: signed_millis(done, planned_start),
            start_delay_ms,
        };

        self.aggregator
            .add_usage(timed.output.cost, timed.output.bytes_scanned);
        self.aggregator.record(record.clone());
        self.states.set(idx, QueryState::Done);
        let left = self.outstanding.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);

        info!(
            idx,
            query_id = record.query_id,
            duration_ms = record.query_duration_ms,
            with_queue_ms = record.query_duration_with_queue_ms,
            relative_start_ms = record.relative_start_ms,
            outstanding = left,
            "completed"
        );
        Ok(record)
    }

    async fn run_with_retries(&self, idx: usize, query: &ScheduledQuery) -> Result<TimedOutput> {
        let template = self.templates.get(query.query_id)?;
        let mut attempt = 0u32;
        loop {
            self.budget.check()?;
            attempt += 1;
            match self.attempt(idx, query, template, attempt).await {
                Ok(timed) => return Ok(timed),
                Err(err) if err.is_transient() => self.backoff().await,
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(
        &self,
        idx: usize,
        query: &ScheduledQuery,
        template: &Template,
        attempt: u32,
    ) -> Result<TimedOutput> {
        let args = &query.arguments;
        match template {
            Template::Single(sql) => {
                info!(idx, "running: {}", one_line(&fill_binds(sql, args)));
                let mut handle = self.pool.acquire().await?;
                let reservation = self.budget.reserve().await?;
                let result = self.pool.execute(&mut handle, sql, args).await;
                self.pool.release(handle);
                self.settle(idx, query, attempt, reservation, result)
            }
            Template::Fragments(parts) if !self.execute_fragments => {
                let rendered: Vec<String> = parts
                    .iter()
                    .map(|p| one_line(&fill_binds(p, args)))
                    .collect();
                info!(idx, "running (not really): {}", rendered.join(" "));
                Ok(TimedOutput {
                    output: Default::default(),
                    duration: Duration::ZERO,
                })
            }
            Template::Fragments(parts) => {
                info!(idx, fragments = parts.len(), "running fragments");
                let mut handle = self.pool.acquire().await?;
                let reservation = self.budget.reserve().await?;
                let result = self.pool.execute_all(&mut handle, parts, args).await;
                self.pool.release(handle);
                self.settle(idx, query, attempt, reservation, result)
            }
        }
    }

    /// Return the reservation on success, spend it on a transient failure.
    fn settle(
        &self,
        idx: usize,
        query: &ScheduledQuery,
        attempt: u32,
        reservation: Reservation<'_>,
        result: Result<TimedOutput>,
    ) -> Result<TimedOutput> {
        let err = match result {
            Err(err) if err.is_transient() => err,
            other => return other,
        };
        self.states.set(idx, QueryState::Retrying);
        match reservation.charge() {
            Ok(remaining) => {
                warn!(
                    idx,
                    query_id = query.query_id,
                    attempt,
                    remaining_retries = remaining,
                    error = %err,
                    "failed"
                );
                Err(err)
            }
            Err(fatal) => {
                error!(idx, query_id = query.query_id, attempt, error = %err, "failed, retries exceeded");
                Err(fatal)
            }
        }
    }

    async fn backoff(&self) {
        if self.retry_backoff.is_zero() {
            return;
        }
        let half = (self.retry_backoff.as_millis() / 2) as u64;
        let jitter = rand::thread_rng().gen_range(0..=half);
        let delay = self.retry_backoff + Duration::from_millis(jitter);
        debug!(?delay, "backing off before retry");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn budget_counts_down_to_fatal() {
        let budget = RetryBudget::new(3);
        assert_eq!(budget.reserve().await.unwrap().charge().unwrap(), 2);
        assert_eq!(budget.reserve().await.unwrap().charge().unwrap(), 1);
        assert!(matches!(
            budget.reserve().await.unwrap().charge(),
            Err(BenchError::RetriesExhausted { budget: 3 })
        ));
        assert!(budget.is_exhausted());
        assert!(budget.check().is_err());
        // Spent budgets stay spent.
        assert!(matches!(
            budget.reserve().await,
            Err(BenchError::RetriesExhausted { budget: 3 })
        ));
        assert_eq!(budget.remaining(), 0);
    }

    #[tokio::test]
    async fn dropped_reservation_is_returned() {
        let budget = RetryBudget::new(1);
        let held = budget.reserve().await.unwrap();
        assert!(budget.units.try_acquire().is_err());
        drop(held);
        assert_eq!(budget.remaining(), 1);
        assert_eq!(budget.units.available_permits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_turned_away_once_exhausted() {
        let budget = Arc::new(RetryBudget::new(2));
        let first = budget.reserve().await.unwrap();
        let second = budget.reserve().await.unwrap();

        let waiter = {
            let budget = budget.clone();
            tokio::spawn(async move { budget.reserve().await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        first.charge().unwrap();
        assert!(second.charge().is_err());
        assert!(matches!(
            waiter.await.unwrap(),
            Err(BenchError::RetriesExhausted { budget: 2 })
        ));
    }

    #[test]
    fn zero_budget_is_exhausted_up_front() {
        let budget = RetryBudget::new(0);
        assert!(budget.is_exhausted());
        assert!(budget.units.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_charges_never_double_spend() {
        let budget = Arc::new(RetryBudget::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = budget.clone();
                tokio::spawn(async move {
                    let mut ok = 0;
                    for _ in 0..200 {
                        let Ok(reservation) = budget.reserve().await else {
                            break;
                        };
                        if reservation.charge().is_ok() {
                            ok += 1;
                        }
                    }
                    ok
                })
            })
            .collect();
        let mut ok = 0;
        for handle in handles {
            ok += handle.await.unwrap();
        }
        // The final unit is charged but reported as exhaustion.
        assert_eq!(ok, 999);
        assert_eq!(budget.remaining(), 0);
    }
}
