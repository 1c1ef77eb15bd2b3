#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use query_stream_bench::{
    BenchError, Driver, QueryOutput, QueryStream, ResourcePool, Result, Scalar, ScheduledQuery,
    Template, TemplateSet,
};

#[derive(Debug, Clone, Copy)]
pub enum FailMode {
    Never,
    Always,
    /// Fail this many executions, then succeed.
    First(usize),
}

/// In-memory driver that sleeps instead of querying and keeps score.
pub struct MockDriver {
    default_latency: Duration,
    latencies: HashMap<String, Duration>,
    fail_mode: FailMode,
    failures_left: AtomicUsize,
    next_conn: AtomicU64,
    pub executes: AtomicUsize,
    pub current: AtomicUsize,
    pub peak: AtomicUsize,
    pub started: Mutex<Vec<(String, Instant)>>,
}

impl MockDriver {
    pub fn new(default_latency: Duration) -> Self {
        Self {
            default_latency,
            latencies: HashMap::new(),
            fail_mode: FailMode::Never,
            failures_left: AtomicUsize::new(0),
            next_conn: AtomicU64::new(0),
            executes: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, sql: &str, latency: Duration) -> Self {
        self.latencies.insert(sql.to_string(), latency);
        self
    }

    pub fn failing(mut self, mode: FailMode) -> Self {
        if let FailMode::First(n) = mode {
            self.failures_left = AtomicUsize::new(n);
        }
        self.fail_mode = mode;
        self
    }

    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<(String, Instant)> {
        self.started.lock().unwrap().clone()
    }

    fn should_fail(&self) -> bool {
        match self.fail_mode {
            FailMode::Never => false,
            FailMode::Always => true,
            FailMode::First(_) => self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
        }
    }
}

#[async_trait]
impl Driver for MockDriver {
    type Connection = u64;

    async fn connect(&self) -> Result<u64> {
        Ok(self.next_conn.fetch_add(1, Ordering::SeqCst))
    }

    async fn execute(&self, _conn: &mut u64, sql: &str, _binds: &[Scalar]) -> Result<QueryOutput> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        self.started
            .lock()
            .unwrap()
            .push((sql.to_string(), Instant::now()));
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let latency = self
            .latencies
            .get(sql)
            .copied()
            .unwrap_or(self.default_latency);
        tokio::time::sleep(latency).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        if self.should_fail() {
            return Err(BenchError::execution(format!("mock failure for {sql}")));
        }
        Ok(QueryOutput {
            rows: 1,
            affected_rows: 0,
            cost: None,
            bytes_scanned: Some(100),
        })
    }
}

/// Query id `n` maps to `select n`; id 23 to two fragments.
pub fn templates() -> Arc<TemplateSet> {
    let mut entries: Vec<(u32, Template)> = (1..=22)
        .map(|id| (id, Template::Single(format!("select {id}"))))
        .collect();
    entries.push((
        23,
        Template::Fragments(vec!["insert into t values ($1)".into(), "delete from t".into()]),
    ));
    Arc::new(TemplateSet::from_entries(entries))
}

pub fn query(query_id: u32, start: u64) -> ScheduledQuery {
    ScheduledQuery {
        query_id,
        start_offset_ms: start,
        arguments: Vec::new(),
    }
}

pub fn stream(queries: Vec<ScheduledQuery>) -> QueryStream {
    QueryStream {
        database_id: Scalar::Int(1),
        scale_factor: Scalar::Int(1),
        queries,
        extra: Default::default(),
    }
}

pub fn pool(driver: MockDriver, capacity: usize) -> Arc<ResourcePool<MockDriver>> {
    Arc::new(ResourcePool::new(driver, capacity).unwrap())
}
