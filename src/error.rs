use std::path::PathBuf;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = BenchError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    /// Any failure reported by the driver while connecting or executing.
    #[error("query execution failed: {0}")]
    Execution(#[source] BoxError),

    #[error("retries exceeded: shared budget of {budget} failed attempts is spent")]
    RetriesExhausted { budget: u32 },

    #[error("failed to write report to {path}: {source}")]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no template for query id {0}")]
    UnknownQuery(u32),

    #[error("failed to load query stream {path}: {message}")]
    StreamLoad { path: PathBuf, message: String },

    #[error("failed to load template {path}: {source}")]
    TemplateLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run did not finish within {0:?}")]
    RunTimeout(std::time::Duration),

    #[error("query task failed: {0}")]
    TaskFailed(String),
}

impl BenchError {
    pub fn execution<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        BenchError::Execution(err.into())
    }

    /// Only driver failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, BenchError::Execution(_))
    }
}

impl From<sqlx::Error> for BenchError {
    fn from(err: sqlx::Error) -> Self {
        BenchError::Execution(Box::new(err))
    }
}
