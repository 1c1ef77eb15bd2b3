//! Scheduled dispatcher: replays a stream so every query starts at `epoch + offset`.
//!
//! Each query gets its own task with a single deadline timer, so a slow or late query never
//! holds back another query's start. The only coupling between tasks is the resource pool's
//! capacity and the shared retry budget.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, error, info};

use crate::config::RunConfig;
use crate::error::{BenchError, Result};
use crate::executor::{QueryRunner, RetryBudget};
use crate::pool::{Driver, ResourcePool};
use crate::report::{Aggregator, ExecutionRecord, RunReport};
use crate::stream::QueryStream;
use crate::templates::TemplateSet;

/// `later - earlier` in whole milliseconds, negative when `later` is actually earlier.
pub fn signed_millis(later: Instant, earlier: Instant) -> i64 {
    if later >= earlier {
        (later - earlier).as_millis() as i64
    } else {
        -((earlier - later).as_millis() as i64)
    }
}

/// Shared reference point for every offset in a run, on both the monotonic and the wall clock.
#[derive(Debug, Clone, Copy)]
pub struct RunEpoch {
    instant: Instant,
    unix_ms: i64,
}

impl RunEpoch {
    pub fn after(lead_time: Duration) -> Self {
        let instant = Instant::now() + lead_time;
        let unix_ms = Utc::now().timestamp_millis() + lead_time.as_millis() as i64;
        Self { instant, unix_ms }
    }

    pub fn instant(&self) -> Instant {
        self.instant
    }

    pub fn unix_ms(&self) -> i64 {
        self.unix_ms
    }

    pub fn planned_start(&self, offset_ms: u64) -> Instant {
        self.instant + Duration::from_millis(offset_ms)
    }

    pub fn millis_since(&self, at: Instant) -> i64 {
        signed_millis(at, self.instant)
    }

    pub fn unix_ms_at(&self, at: Instant) -> i64 {
        self.unix_ms + self.millis_since(at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Pending,
    Waiting,
    Running,
    Retrying,
    Done,
    Fatal,
}

/// Current state of every query in the stream, by index.
#[derive(Debug, Clone, Default)]
pub struct StateBoard(Arc<Mutex<Vec<QueryState>>>);

impl StateBoard {
    pub fn new(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![QueryState::Pending; len])))
    }

    pub fn set(&self, idx: usize, state: QueryState) {
        let mut states = self.0.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = states.get_mut(idx) {
            debug!(idx, from = ?*slot, to = ?state, "state");
            *slot = state;
        }
    }

    /// Mark every query that has not finished as `Fatal`. Returns how many were marked.
    pub fn fail_unfinished(&self) -> usize {
        let mut states = self.0.lock().unwrap_or_else(|p| p.into_inner());
        let mut marked = 0;
        for state in states.iter_mut().filter(|s| **s != QueryState::Done) {
            *state = QueryState::Fatal;
            marked += 1;
        }
        marked
    }

    pub fn snapshot(&self) -> Vec<QueryState> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn count(&self, state: QueryState) -> usize {
        self.snapshot().iter().filter(|s| **s == state).count()
    }
}

pub struct Dispatcher<D: Driver> {
    stream: Arc<QueryStream>,
    pool: Arc<ResourcePool<D>>,
    templates: Arc<TemplateSet>,
    config: RunConfig,
    epoch: RunEpoch,
    aggregator: Arc<Aggregator>,
    budget: Arc<RetryBudget>,
    outstanding: Arc<AtomicUsize>,
    states: StateBoard,
}

impl<D: Driver> Dispatcher<D> {
    /// Validate the run and fix its epoch at `now + lead_time`.
    pub fn new(
        stream: QueryStream,
        pool: Arc<ResourcePool<D>>,
        templates: Arc<TemplateSet>,
        config: RunConfig,
    ) -> Result<Self> {
        config.validate()?;
        for query_id in stream.query_ids() {
            templates.get(query_id)?;
        }

        let epoch = RunEpoch::after(config.lead_time);
        let states = StateBoard::new(stream.queries.len());
        let budget = Arc::new(RetryBudget::new(config.retry_budget));
        Ok(Self {
            stream: Arc::new(stream),
            pool,
            templates,
            config,
            epoch,
            aggregator: Arc::new(Aggregator::new()),
            budget,
            outstanding: Arc::new(AtomicUsize::new(0)),
            states,
        })
    }

    pub fn epoch(&self) -> RunEpoch {
        self.epoch
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn states(&self) -> Vec<QueryState> {
        self.states.snapshot()
    }

    pub fn retry_budget(&self) -> &RetryBudget {
        &self.budget
    }

    /// Records gathered so far, with run time measured up to now.
    pub fn partial_report(&self) -> RunReport {
        let elapsed = self.epoch.millis_since(Instant::now());
        self.aggregator
            .snapshot(self.stream.database_id.clone(), elapsed)
    }

    /// Schedule every query, wait until each one has a record, and build the report.
    ///
    /// On a fatal error the remaining tasks are cancelled. Cancelling a task drops any pool
    /// handle it holds, and the pool is drained before the error is returned.
    pub async fn run(&self) -> Result<RunReport> {
        let runner = Arc::new(QueryRunner {
            pool: self.pool.clone(),
            templates: self.templates.clone(),
            budget: self.budget.clone(),
            aggregator: self.aggregator.clone(),
            outstanding: self.outstanding.clone(),
            states: self.states.clone(),
            epoch: self.epoch,
            execute_fragments: self.config.execute_fragments,
            retry_backoff: self.config.retry_backoff,
        });

        let mut tasks = JoinSet::new();
        for (idx, query) in self.stream.queries.iter().enumerate() {
            let query = query.clone();
            let runner = runner.clone();
            let planned_start = self.epoch.planned_start(query.start_offset_ms);
            self.outstanding.fetch_add(1, Ordering::SeqCst);
            tasks.spawn(async move {
                if Instant::now() < planned_start {
                    runner.states.set(idx, QueryState::Waiting);
                    time::sleep_until(planned_start).await;
                }
                runner.run(idx, &query).await
            });
        }
        info!(
            database_id = %self.stream.database_id,
            queries = self.stream.queries.len(),
            capacity = self.pool.capacity(),
            "scheduled query stream"
        );

        let joined = match self.config.run_timeout {
            Some(limit) => time::timeout(limit, join_all(&mut tasks))
                .await
                .unwrap_or(Err(BenchError::RunTimeout(limit))),
            None => join_all(&mut tasks).await,
        };

        if let Err(err) = joined {
            error!(error = %err, outstanding = self.outstanding(), "aborting run");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            let cancelled = self.states.fail_unfinished();
            debug!(cancelled, "marked unfinished queries fatal");
            self.pool.drain().await;
            return Err(err);
        }

        let total_time_ms = self.epoch.millis_since(Instant::now());
        self.pool.drain().await;
        Ok(self
            .aggregator
            .snapshot(self.stream.database_id.clone(), total_time_ms))
    }
}

async fn join_all(tasks: &mut JoinSet<Result<ExecutionRecord>>) -> Result<()> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err),
            Err(join_err) => return Err(BenchError::TaskFailed(join_err.to_string())),
        }
    }
    Ok(())
}
