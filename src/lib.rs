//! Query stream replay for multi-database TPC-H benchmarks.
//!
//! A stream is a list of parameterised queries with start offsets. The [`Dispatcher`] starts
//! each query at `epoch + offset` through a [`ResourcePool`] that bounds concurrency, retries
//! failures against a run-wide budget, and collects one [`ExecutionRecord`] per query.

pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod executor;
pub mod logging;
pub mod pool;
pub mod report;
pub mod setup;
pub mod stream;
pub mod templates;

pub use config::{ConnectionConfig, RunConfig};
pub use dispatcher::{Dispatcher, QueryState, RunEpoch};
pub use driver::SqlxDriver;
pub use error::{BenchError, Result};
pub use executor::RetryBudget;
pub use pool::{Driver, PoolHandle, QueryOutput, ResourcePool, TimedOutput};
pub use report::{Aggregator, ExecutionRecord, RunReport};
pub use stream::{QueryStream, Scalar, ScheduledQuery};
pub use templates::{Template, TemplateSet};
