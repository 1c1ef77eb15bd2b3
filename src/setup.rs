//! Benchmark bootstrap: per-database TPC-H tables and the load-job table that the loaders
//! pick chunks from.

use std::io::{self, BufRead, Write};
use std::path::Path;

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::error::{BenchError, Result};
use crate::pool::{Driver, ResourcePool};
use crate::stream::{Scalar, StreamMeta};
use crate::templates::FRAGMENT_SEPARATOR;

pub const DATABASE_ID_PLACEHOLDER: &str = ":database_id:";
pub const DDL_FILES: [&str; 2] = ["drop_table_ddl.sql", "create_table_ddl.sql"];

pub const JOBS_TABLE_DDL: &str = "create table jobs(job_id int, database_id int, scale_factor int, table_name varchar(152), chunk_count int, step int, status varchar(152));";
pub const INSERT_JOB_SQL: &str = "insert into jobs values($1, $2, $3, $4, $5, $6, $7);";

/// Gigabytes per unit of scale factor for the tables that get chunked.
pub const CHUNKED_TABLES: [(&str, f64); 6] = [
    ("customer", 0.023),
    ("lineitem", 0.725),
    ("orders", 0.164),
    ("part", 0.023),
    ("partsupp", 0.113),
    ("supplier", 0.001),
];

/// Tables small enough to always load as a single chunk.
pub const SINGLE_CHUNK_TABLES: [&str; 2] = ["region", "nation"];

#[derive(Debug, Clone, PartialEq)]
pub struct LoadJob {
    pub job_id: i64,
    pub database_id: Scalar,
    pub scale_factor: Scalar,
    pub table_name: String,
    pub chunk_count: i64,
    pub step: i64,
    pub status: String,
}

impl LoadJob {
    pub fn binds(&self) -> Vec<Scalar> {
        vec![
            Scalar::Int(self.job_id),
            self.database_id.clone(),
            self.scale_factor.clone(),
            Scalar::Text(self.table_name.clone()),
            Scalar::Int(self.chunk_count),
            Scalar::Int(self.step),
            Scalar::Text(self.status.clone()),
        ]
    }
}

pub fn chunk_count(scale_factor: f64, gb_per_scale_factor: f64, gb_per_chunk: f64) -> i64 {
    ((scale_factor * gb_per_scale_factor) / gb_per_chunk).ceil() as i64
}

/// One job per chunk, table by table across all databases, ids counting up from 1.
pub fn plan_load_jobs(streams: &[StreamMeta], gb_per_chunk: f64) -> Vec<LoadJob> {
    let mut jobs = Vec::new();
    let mut next_id = 1i64;
    let mut push = |meta: &StreamMeta, table: &str, chunks: i64, jobs: &mut Vec<LoadJob>| {
        for step in 1..=chunks {
            jobs.push(LoadJob {
                job_id: next_id,
                database_id: meta.database_id.clone(),
                scale_factor: meta.scale_factor.clone(),
                table_name: table.to_string(),
                chunk_count: chunks,
                step,
                status: "open".to_string(),
            });
            next_id += 1;
        }
    };

    for table in SINGLE_CHUNK_TABLES {
        for meta in streams {
            push(meta, table, 1, &mut jobs);
        }
    }
    for (table, gb_per_sf) in CHUNKED_TABLES {
        for meta in streams {
            let chunks = chunk_count(meta.scale_factor_f64(), gb_per_sf, gb_per_chunk);
            push(meta, table, chunks, &mut jobs);
        }
    }
    jobs
}

/// Bind a DDL template to one database and split it into statements.
pub fn render_ddl(template: &str, database_id: &Scalar) -> Vec<String> {
    template
        .replace(DATABASE_ID_PLACEHOLDER, &database_id.to_string())
        .replace('\n', "")
        .split(FRAGMENT_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `create table foo_1 (...)` logs as `create table foo_1 ;`.
pub fn ddl_headline(statement: &str) -> String {
    let cut = statement
        .find('(')
        .or_else(|| statement.find(';'))
        .unwrap_or(statement.len());
    format!("{};", &statement[..cut])
}

/// `y`/`yes` in any case, surrounding whitespace ignored. Anything else declines.
pub fn is_confirmation(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Ask before dropping tables. End of input counts as a no.
pub fn confirm_run<R: BufRead, W: Write>(
    mut input: R,
    mut output: W,
    databases: usize,
) -> io::Result<bool> {
    write!(
        output,
        "This drops and recreates the tables of {databases} databases. Continue? [y/N] "
    )?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(is_confirmation(&answer))
}

/// Run statements concurrently through the pool and wait for it to drain.
/// Returns how many statements failed.
async fn run_all<D: Driver>(
    pool: &ResourcePool<D>,
    statements: &[(String, Vec<Scalar>)],
) -> usize {
    let results = join_all(
        statements
            .iter()
            .map(|(sql, binds)| pool.run(sql, binds)),
    )
    .await;
    pool.drain().await;

    let mut failed = 0;
    for ((sql, _), result) in statements.iter().zip(results) {
        if let Err(err) = result {
            warn!(statement = %ddl_headline(sql), error = %err, "statement failed");
            failed += 1;
        }
    }
    failed
}

/// Drop and recreate the benchmark tables for every database.
pub async fn create_data_tables<D: Driver>(
    pool: &ResourcePool<D>,
    ddl_dir: &Path,
    streams: &[StreamMeta],
) -> Result<usize> {
    let mut failed = 0;
    for file in DDL_FILES {
        let path = ddl_dir.join(file);
        info!(file = %path.display(), "applying ddl");
        let template = std::fs::read_to_string(&path)
            .map_err(|source| BenchError::TemplateLoad { path, source })?;
        for meta in streams {
            let statements: Vec<(String, Vec<Scalar>)> = render_ddl(&template, &meta.database_id)
                .into_iter()
                .map(|sql| {
                    info!("{}", ddl_headline(&sql));
                    (sql, Vec::new())
                })
                .collect();
            failed += run_all(pool, &statements).await;
        }
    }
    Ok(failed)
}

pub async fn create_job_table<D: Driver>(pool: &ResourcePool<D>) -> Result<()> {
    info!("creating load job table");
    pool.run(JOBS_TABLE_DDL, &[]).await?;
    pool.drain().await;
    Ok(())
}

pub async fn insert_load_jobs<D: Driver>(pool: &ResourcePool<D>, jobs: &[LoadJob]) -> usize {
    info!(jobs = jobs.len(), "creating load jobs");
    let statements: Vec<(String, Vec<Scalar>)> = jobs
        .iter()
        .map(|job| (INSERT_JOB_SQL.to_string(), job.binds()))
        .collect();
    run_all(pool, &statements).await
}
