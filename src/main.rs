//! Query stream runner - replays one stream against one database and logs latencies.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use query_stream_bench::config::{
    DEFAULT_CAPACITY, DEFAULT_OUTPUT_FILE, DEFAULT_RETRY_BUDGET,
    DEFAULT_STREAM_DIR, DEFAULT_TEMPLATE_DIR,
};
use query_stream_bench::{
    logging, ConnectionConfig, Dispatcher, QueryStream, ResourcePool, RunConfig, SqlxDriver,
    TemplateSet,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay a TPC-H query stream with its original arrival times")]
struct Args {
    /// Stream to run; loads `<stream-dir>/query_stream_<id>.json`
    stream_id: u32,

    /// Database URL (postgres://... or mysql://...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Directory holding query_stream_<id>.json files
    #[arg(long, default_value = DEFAULT_STREAM_DIR)]
    stream_dir: PathBuf,

    /// Directory holding 1.sql .. 23.sql for the target database
    #[arg(long, default_value = DEFAULT_TEMPLATE_DIR)]
    template_dir: PathBuf,

    /// Maximum number of concurrently executing queries
    #[arg(short, long, default_value_t = DEFAULT_CAPACITY)]
    concurrency: usize,

    /// Delay between setup and the run epoch
    #[arg(long, default_value = "2s")]
    lead_time: humantime::Duration,

    /// Failed attempts allowed across the whole run
    #[arg(long, default_value_t = DEFAULT_RETRY_BUDGET)]
    retry_budget: u32,

    /// Pause before each retry (plus jitter); 0s retries immediately
    #[arg(long, default_value = "0s")]
    retry_backoff: humantime::Duration,

    /// Abort the run if it has not finished within this time
    #[arg(long)]
    run_timeout: Option<humantime::Duration>,

    /// Execute the statements of multi-statement queries instead of only logging them
    #[arg(long, default_value_t = false)]
    execute_fragments: bool,

    /// CSV output path
    #[arg(long, default_value = DEFAULT_OUTPUT_FILE)]
    output_file: PathBuf,

    /// Enable verbose logging
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

impl Args {
    fn run_config(&self) -> RunConfig {
        RunConfig {
            capacity: self.concurrency,
            lead_time: self.lead_time.into(),
            retry_budget: self.retry_budget,
            execute_fragments: self.execute_fragments,
            retry_backoff: self.retry_backoff.into(),
            run_timeout: self.run_timeout.map(Into::into),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = args.run_config();
    config.validate()?;
    let connection = ConnectionConfig::from_url(args.database_url.clone())?;

    println!("--- Query stream benchmark ---");
    println!("stream_id      : {}", args.stream_id);
    println!("concurrency    : {}", config.capacity);
    println!("lead_time      : {:?}", config.lead_time);
    println!("retry_budget   : {}", config.retry_budget);
    println!("output_file    : {}", args.output_file.display());

    let stream = QueryStream::load(&args.stream_dir, args.stream_id)
        .context("load query stream")?;
    info!(
        database_id = %stream.database_id,
        scale_factor = %stream.scale_factor,
        queries = stream.queries.len(),
        meta = %serde_json::Value::Object(stream.extra.clone()),
        "loaded query stream"
    );
    let templates = TemplateSet::load(&args.template_dir, &stream.database_id)
        .context("load query templates")?;

    let driver = SqlxDriver::open(&connection, config.capacity as u32)
        .await
        .context("connect to database")?;
    let pool = Arc::new(ResourcePool::new(driver, config.capacity)?);

    let dispatcher = Dispatcher::new(stream, pool.clone(), Arc::new(templates), config)?;
    let outcome = dispatcher.run().await;

    let report = match &outcome {
        Ok(report) => report.clone(),
        Err(err) => {
            error!(error = %err, "run aborted, writing partial report");
            dispatcher.partial_report()
        }
    };

    report.print_summary();
    match report.write_csv(&args.output_file) {
        Ok(()) => println!("\n✓ Wrote CSV to {}", args.output_file.display()),
        Err(err) => error!(error = %err, "failed to write CSV"),
    }
    pool.driver().close().await;

    outcome.context("query stream run failed")?;
    println!("\nNormal program exit: done :)");
    Ok(())
}
