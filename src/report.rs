//! Run aggregation: one [`ExecutionRecord`] per scheduled query, rendered as CSV plus a
//! console summary.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

use crate::error::{BenchError, Result};
use crate::stream::Scalar;

pub const CSV_HEADER: &str = "query_stream_id,query_id,start_ts,relative_start_ms,query_duration_ms,query_duration_with_queue_ms,start_delay_ms";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    /// Position of the query in its stream.
    pub index: usize,
    pub query_id: u32,
    /// Wall-clock start, unix milliseconds.
    pub actual_start_ts: i64,
    pub relative_start_ms: i64,
    pub query_duration_ms: u64,
    pub query_duration_with_queue_ms: i64,
    /// Negative when the query started ahead of its planned time.
    pub start_delay_ms: i64,
}

impl ExecutionRecord {
    fn csv_row(&self, stream_id: &Scalar) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            stream_id,
            self.query_id,
            self.actual_start_ts,
            self.relative_start_ms,
            self.query_duration_ms,
            self.query_duration_with_queue_ms,
            self.start_delay_ms
        )
    }
}

#[derive(Default)]
struct AggregatorState {
    records: Vec<ExecutionRecord>,
    indices: HashSet<usize>,
    total_cost: f64,
    total_scanned: u64,
}

/// Collects records in completion order. Shared by every query task of a run.
#[derive(Default)]
pub struct Aggregator {
    state: Mutex<AggregatorState>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a record. A second record for the same index is dropped and `false` returned.
    pub fn record(&self, record: ExecutionRecord) -> bool {
        let mut state = self.lock();
        if !state.indices.insert(record.index) {
            warn!(idx = record.index, "duplicate execution record ignored");
            return false;
        }
        state.records.push(record);
        true
    }

    pub fn add_usage(&self, cost: Option<f64>, bytes_scanned: Option<u64>) {
        let mut state = self.lock();
        state.total_cost += cost.unwrap_or(0.0);
        state.total_scanned += bytes_scanned.unwrap_or(0);
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self, stream_id: Scalar, total_time_ms: i64) -> RunReport {
        let state = self.lock();
        RunReport {
            stream_id,
            records: state.records.clone(),
            total_time_ms,
            total_cost: state.total_cost,
            total_scanned: state.total_scanned,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stream_id: Scalar,
    pub records: Vec<ExecutionRecord>,
    /// Epoch to the moment the last record existed.
    pub total_time_ms: i64,
    pub total_cost: f64,
    pub total_scanned: u64,
}

impl RunReport {
    pub fn total_start_delay_ms(&self) -> i64 {
        self.records.iter().map(|r| r.start_delay_ms).sum()
    }

    pub fn total_query_duration_ms(&self) -> u64 {
        self.records.iter().map(|r| r.query_duration_ms).sum()
    }

    pub fn total_query_duration_with_queue_ms(&self) -> i64 {
        self.records
            .iter()
            .map(|r| r.query_duration_with_queue_ms)
            .sum()
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::with_capacity(64 * (self.records.len() + 1));
        out.push_str(CSV_HEADER);
        out.push('\n');
        for record in &self.records {
            out.push_str(&record.csv_row(&self.stream_id));
            out.push('\n');
        }
        out
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let wrap = |source| BenchError::ReportWrite {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(wrap)?;
        }
        let file = File::create(path).map_err(wrap)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(self.to_csv().as_bytes()).map_err(wrap)?;
        writer.flush().map_err(wrap)?;
        Ok(())
    }

    pub fn print_summary(&self) {
        println!("-- START CSV --");
        println!("{}", self.to_csv().trim_end());
        println!("-- STOP CSV --");

        println!();
        println!("=== Summary ===");
        println!("Queries                  : {}", self.records.len());
        println!("total_time               : {}", self.total_time_ms);
        println!("total_lost               : {}", self.total_start_delay_ms());
        println!("query_duration           : {}", self.total_query_duration_ms());
        println!(
            "query_duration_with_queue: {}",
            self.total_query_duration_with_queue_ms()
        );
        println!("total_cost               : {}", self.total_cost);
        println!("total_scanned            : {}", self.total_scanned);

        let mut durations: Vec<u64> = self.records.iter().map(|r| r.query_duration_ms).collect();
        print_statistics("duration", &mut durations);
        let mut queued: Vec<u64> = self
            .records
            .iter()
            .map(|r| r.query_duration_with_queue_ms.max(0) as u64)
            .collect();
        print_statistics("with_queue", &mut queued);
    }
}

/// p50, p95, p99 and max of millisecond samples.
pub fn calculate_percentiles(latencies: &mut [u64]) -> (u64, u64, u64, u64) {
    if latencies.is_empty() {
        return (0, 0, 0, 0);
    }

    latencies.sort_unstable();
    let len = latencies.len();

    let p50 = latencies[len / 2];
    let p95 = latencies[(len * 95 / 100).min(len - 1)];
    let p99 = latencies[(len * 99 / 100).min(len - 1)];
    let max = latencies[len - 1];

    (p50, p95, p99, max)
}

fn print_statistics(name: &str, latencies: &mut [u64]) {
    if latencies.is_empty() {
        println!("{}: no samples", name);
        return;
    }
    let (p50, p95, p99, max) = calculate_percentiles(latencies);
    println!(
        "{:<10} p50={}ms p95={}ms p99={}ms max={}ms",
        name, p50, p95, p99, max
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: usize, query_id: u32, delay: i64) -> ExecutionRecord {
        ExecutionRecord {
            index,
            query_id,
            actual_start_ts: 1_700_000_000_000 + index as i64,
            relative_start_ms: 1000 * index as i64,
            query_duration_ms: 40,
            query_duration_with_queue_ms: 50 + delay,
            start_delay_ms: delay,
        }
    }

    #[test]
    fn renders_header_and_rows_in_append_order() {
        let agg = Aggregator::new();
        agg.record(record(1, 2, 3));
        agg.record(record(0, 1, -1));
        let report = agg.snapshot(Scalar::Int(4), 2500);

        let csv = report.to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "4,2,1700000000001,1000,40,53,3");
        assert_eq!(lines[2], "4,1,1700000000000,0,40,49,-1");
    }

    #[test]
    fn totals_sum_every_record() {
        let agg = Aggregator::new();
        agg.record(record(0, 1, 5));
        agg.record(record(1, 1, -2));
        agg.add_usage(Some(0.25), Some(1024));
        agg.add_usage(None, Some(1));
        let report = agg.snapshot(Scalar::Int(1), 10);

        assert_eq!(report.total_start_delay_ms(), 3);
        assert_eq!(report.total_query_duration_ms(), 80);
        assert_eq!(report.total_query_duration_with_queue_ms(), 103);
        assert_eq!(report.total_cost, 0.25);
        assert_eq!(report.total_scanned, 1025);
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let agg = Aggregator::new();
        assert!(agg.record(record(0, 1, 0)));
        assert!(!agg.record(record(0, 1, 0)));
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn same_records_render_same_rows_regardless_of_order() {
        let forward = Aggregator::new();
        let backward = Aggregator::new();
        let records: Vec<_> = (0..5).map(|i| record(i, i as u32 + 1, i as i64)).collect();
        for r in &records {
            forward.record(r.clone());
        }
        for r in records.iter().rev() {
            backward.record(r.clone());
        }

        let rows = |agg: &Aggregator| {
            let mut rows: Vec<String> = agg
                .snapshot(Scalar::Int(1), 0)
                .to_csv()
                .lines()
                .map(str::to_string)
                .collect();
            rows.sort();
            rows
        };
        assert_eq!(rows(&forward), rows(&backward));
    }

    #[test]
    fn percentiles_index_into_sorted_samples() {
        let mut samples: Vec<u64> = (1..=100).rev().collect();
        assert_eq!(calculate_percentiles(&mut samples), (51, 96, 100, 100));
        assert_eq!(calculate_percentiles(&mut []), (0, 0, 0, 0));
        assert_eq!(calculate_percentiles(&mut [42]), (42, 42, 42, 42));

        let mut unsorted = [30, 10, 20];
        assert_eq!(calculate_percentiles(&mut unsorted), (20, 30, 30, 30));
        assert_eq!(unsorted, [10, 20, 30]);
    }

    #[test]
    fn writes_csv_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("query_log.csv");
        let agg = Aggregator::new();
        agg.record(record(0, 6, 0));
        agg.snapshot(Scalar::Int(9), 1).write_csv(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with(CSV_HEADER));
        assert_eq!(written.lines().count(), 2);
    }

    #[test]
    fn unwritable_path_is_a_report_error() {
        let dir = tempfile::tempdir().unwrap();
        let report = Aggregator::new().snapshot(Scalar::Int(1), 0);
        // A directory cannot be opened as a file.
        let err = report.write_csv(dir.path()).unwrap_err();
        assert!(matches!(err, BenchError::ReportWrite { .. }));
    }
}
