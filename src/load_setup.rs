//! Load setup - creates per-database TPC-H tables and the load job table.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use query_stream_bench::config::DEFAULT_STREAM_DIR;
use query_stream_bench::setup::{
    confirm_run, create_data_tables, create_job_table, insert_load_jobs, plan_load_jobs,
};
use query_stream_bench::stream::load_stream_meta;
use query_stream_bench::{logging, ConnectionConfig, ResourcePool, SqlxDriver};

#[derive(Parser, Debug)]
#[command(author, version, about = "Create benchmark tables and load jobs for every query stream")]
struct Args {
    /// Database URL (postgres://... or mysql://...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Directory holding query_stream_<id>.json files
    #[arg(long, default_value = DEFAULT_STREAM_DIR)]
    stream_dir: PathBuf,

    /// Directory holding drop_table_ddl.sql and create_table_ddl.sql
    #[arg(long, default_value = "sql")]
    ddl_dir: PathBuf,

    /// Number of concurrent DDL/insert statements
    #[arg(short, long, default_value_t = 5)]
    concurrency: usize,

    /// Size of one load chunk in GB
    #[arg(long, default_value_t = 1.0)]
    gb_per_chunk: f64,

    /// Do not drop and recreate data tables
    #[arg(long, default_value_t = false)]
    skip_tables: bool,

    /// Do not create the jobs table or its rows
    #[arg(long, default_value_t = false)]
    skip_jobs: bool,

    /// Do not ask for confirmation before dropping tables
    #[arg(short = 'y', long, default_value_t = false)]
    yes: bool,

    /// Enable verbose logging
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    anyhow::ensure!(args.concurrency > 0, "--concurrency must be > 0");
    anyhow::ensure!(args.gb_per_chunk > 0.0, "--gb-per-chunk must be > 0");
    let connection = ConnectionConfig::from_url(args.database_url.clone())?;

    let streams = load_stream_meta(&args.stream_dir).context("load query stream metadata")?;
    info!(databases = streams.len(), "found query streams");

    if !args.skip_tables && !args.yes {
        let confirmed = confirm_run(std::io::stdin().lock(), std::io::stdout(), streams.len())
            .context("read confirmation")?;
        if !confirmed {
            println!("\nAborted, nothing was changed.");
            return Ok(());
        }
    }

    let driver = SqlxDriver::open(&connection, args.concurrency as u32)
        .await
        .context("connect to database")?;
    let pool = ResourcePool::new(driver, args.concurrency)?;

    if !args.skip_tables {
        let failed = create_data_tables(&pool, &args.ddl_dir, &streams)
            .await
            .context("create data tables")?;
        if failed > 0 {
            warn!(failed, "some DDL statements failed");
        }
    }

    if !args.skip_jobs {
        create_job_table(&pool).await.context("create jobs table")?;
        let jobs = plan_load_jobs(&streams, args.gb_per_chunk);
        let failed = insert_load_jobs(&pool, &jobs).await;
        anyhow::ensure!(failed == 0, "{failed} of {} load job inserts failed", jobs.len());
    }

    pool.driver().close().await;
    println!("\nNormal program exit: setup {} databases :)", streams.len());
    Ok(())
}
