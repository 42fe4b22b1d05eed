//! SQL driver backends and dialect capabilities.
//!
//! Two variants of each seam, selected once from a target's [`DriverKind`]:
//! - [`Backend`] - a bounded connection pool that executes SQL and normalizes
//!   the driver's native rows into [`QueryResult`]
//! - [`Dialect`] - catalog queries for table listing and column description,
//!   and parsing of their results

pub mod mysql;
pub mod postgres;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::QuarryResult;
use crate::models::{
    ColumnDescription, DatabaseTarget, DriverKind, PoolStatus, QueryResult, ResolvedEndpoint,
};

/// Maximum connections per (target, driver) pool.
pub const POOL_MAX_SIZE: usize = 5;

/// Time allowed to open one driver connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A bounded pool of live driver connections for one target.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Dialect spoken by this pool.
    fn driver(&self) -> DriverKind;

    /// Execute a statement and normalize its rows.
    async fn execute(&self, sql: &str) -> QuarryResult<QueryResult>;

    /// Current pool occupancy.
    fn status(&self) -> PoolStatus;

    /// Close the pool, dropping all connections.
    async fn close(&self);
}

/// Creates pools against a resolved endpoint.
pub trait BackendFactory: Send + Sync {
    /// Build a pool for `target` connecting to `endpoint`.
    ///
    /// Connections are opened lazily on first use.
    fn create(
        &self,
        target: &DatabaseTarget,
        endpoint: &ResolvedEndpoint,
        max_size: usize,
    ) -> QuarryResult<Arc<dyn Backend>>;
}

/// Production factory: mysql_async for MySQL, deadpool-postgres for PostgreSQL.
#[derive(Debug, Default, Clone, Copy)]
pub struct DriverFactory;

impl BackendFactory for DriverFactory {
    fn create(
        &self,
        target: &DatabaseTarget,
        endpoint: &ResolvedEndpoint,
        max_size: usize,
    ) -> QuarryResult<Arc<dyn Backend>> {
        let backend: Arc<dyn Backend> = match target.driver {
            DriverKind::MySql => Arc::new(mysql::MySqlBackend::new(target, endpoint, max_size)?),
            DriverKind::Postgres => {
                Arc::new(postgres::PostgresBackend::new(target, endpoint, max_size)?)
            }
        };
        Ok(backend)
    }
}

/// Catalog queries and result parsing for one SQL dialect.
pub trait Dialect: Send + Sync {
    /// Statement listing the tables of the target database.
    fn list_tables_sql(&self) -> String;

    /// Statement describing the columns of `table`.
    fn describe_table_sql(&self, table: &str) -> String;

    /// Extract table names from the result of [`Dialect::list_tables_sql`].
    fn parse_tables(&self, result: &QueryResult) -> Vec<String>;

    /// Extract column descriptions from the result of [`Dialect::describe_table_sql`].
    fn parse_columns(&self, result: &QueryResult) -> Vec<ColumnDescription>;
}

/// Quote a string literal by doubling single quotes.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
