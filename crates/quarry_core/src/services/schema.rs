//! Schema introspection service.
//!
//! Lists tables and describes columns using each dialect's catalog queries.
//! All catalog SQL goes through the [`QueryGateway`], so it is subject to the
//! same read-only guard and pool routing as user queries.

use std::sync::Arc;

use crate::error::QuarryResult;
use crate::models::ColumnDescription;
use crate::services::query::QueryGateway;

/// Schema introspection over named targets.
pub struct SchemaIntrospector {
    gateway: Arc<QueryGateway>,
}

impl SchemaIntrospector {
    /// Create an introspector that queries through `gateway`.
    pub fn new(gateway: Arc<QueryGateway>) -> Self {
        Self { gateway }
    }

    /// List the tables of a target.
    ///
    /// MySQL lists the connection's default database; PostgreSQL lists the
    /// `public` schema.
    pub async fn list_tables(&self, target_name: &str) -> QuarryResult<Vec<String>> {
        let dialect = self.gateway.catalog().get(target_name)?.driver.dialect();

        let result = self
            .gateway
            .execute_query(target_name, &dialect.list_tables_sql(), None)
            .await?;
        let tables = dialect.parse_tables(&result);

        tracing::debug!(target_name, count = tables.len(), "Loaded tables");
        Ok(tables)
    }

    /// Describe the columns of `table` in catalog order.
    ///
    /// An unknown table yields an empty list.
    pub async fn describe_table(
        &self,
        target_name: &str,
        table: &str,
    ) -> QuarryResult<Vec<ColumnDescription>> {
        let dialect = self.gateway.catalog().get(target_name)?.driver.dialect();

        let result = self
            .gateway
            .execute_query(target_name, &dialect.describe_table_sql(table), None)
            .await?;
        let columns = dialect.parse_columns(&result);

        tracing::debug!(target_name, table, count = columns.len(), "Loaded columns");
        Ok(columns)
    }
}
