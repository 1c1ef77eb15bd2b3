//! Run settings shared by the binaries and the dispatcher.

use std::time::Duration;

use crate::error::{BenchError, Result};

pub const DEFAULT_CAPACITY: usize = 10;
pub const DEFAULT_LEAD_TIME_MS: u64 = 2000;
pub const DEFAULT_RETRY_BUDGET: u32 = 100;
pub const DEFAULT_STREAM_DIR: &str = "query_streams";
pub const DEFAULT_TEMPLATE_DIR: &str = "sql";
pub const DEFAULT_OUTPUT_FILE: &str = "query_log.csv";

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Maximum number of queries executing against the database at once.
    pub capacity: usize,
    /// Gap between building the dispatcher and the run epoch.
    pub lead_time: Duration,
    /// Failed attempts allowed across the whole run before it is aborted.
    pub retry_budget: u32,
    /// Run the fragments of multi-statement queries instead of only logging them.
    pub execute_fragments: bool,
    /// Pause before a retry; zero retries immediately.
    pub retry_backoff: Duration,
    pub run_timeout: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            lead_time: Duration::from_millis(DEFAULT_LEAD_TIME_MS),
            retry_budget: DEFAULT_RETRY_BUDGET,
            execute_fragments: false,
            retry_backoff: Duration::ZERO,
            run_timeout: None,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(BenchError::Config("concurrency must be > 0".into()));
        }
        if self.retry_budget == 0 {
            return Err(BenchError::Config("retry budget must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub database_url: String,
}

impl ConnectionConfig {
    /// Build from an optional URL, failing before anything touches the database.
    pub fn from_url(url: Option<String>) -> Result<Self> {
        match url {
            Some(url) if !url.trim().is_empty() => Ok(Self { database_url: url }),
            _ => Err(BenchError::Config(
                "database url is required (pass --database-url or set DATABASE_URL)".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_run() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.capacity, 10);
        assert_eq!(cfg.lead_time, Duration::from_millis(2000));
        assert_eq!(cfg.retry_budget, 100);
        assert!(!cfg.execute_fragments);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let cfg = RunConfig {
            capacity: 0,
            ..RunConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(BenchError::Config(_))));
    }

    #[test]
    fn missing_url_is_a_config_error() {
        assert!(matches!(
            ConnectionConfig::from_url(None),
            Err(BenchError::Config(_))
        ));
        assert!(ConnectionConfig::from_url(Some("  ".into())).is_err());
        let cfg = ConnectionConfig::from_url(Some("postgres://localhost/tpch".into())).unwrap();
        assert_eq!(cfg.database_url, "postgres://localhost/tpch");
    }
}
