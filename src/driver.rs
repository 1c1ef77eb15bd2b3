//! `sqlx` backed driver. The URL scheme picks the wire protocol, so the same binary
//! talks to Postgres-compatible warehouses (Redshift) and MySQL-compatible ones (TiDB).

use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::any::{AnyPoolOptions, AnyArguments};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Either};

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::pool::{Driver, QueryOutput};
use crate::stream::Scalar;

pub struct SqlxDriver {
    pool: AnyPool,
}

impl SqlxDriver {
    /// Open a connection pool sized to `max_connections`.
    pub async fn open(config: &ConnectionConfig, max_connections: u32) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    binds: &[Scalar],
) -> Query<'q, Any, AnyArguments<'q>> {
    for bind in binds {
        query = match bind {
            Scalar::Int(v) => query.bind(*v),
            Scalar::Float(v) => query.bind(*v),
            Scalar::Text(v) => query.bind(v.clone()),
        };
    }
    query
}

#[async_trait]
impl Driver for SqlxDriver {
    type Connection = PoolConnection<Any>;

    async fn connect(&self) -> Result<Self::Connection> {
        Ok(self.pool.acquire().await?)
    }

    async fn execute(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        binds: &[Scalar],
    ) -> Result<QueryOutput> {
        let query = bind_all(sqlx::query(sql), binds);
        let mut results = query.fetch_many(&mut **conn);

        let mut output = QueryOutput::default();
        while let Some(item) = results.try_next().await? {
            match item {
                Either::Left(done) => output.affected_rows += done.rows_affected(),
                Either::Right(_row) => output.rows += 1,
            }
        }
        Ok(output)
    }
}
