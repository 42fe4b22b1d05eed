//! Read-only query execution against named targets.
//!
//! Provides query execution with:
//! - A best-effort read-only guard on the statement prefix
//! - Optional textual `LIMIT` injection
//! - Pool lookup per target, normalized results from either driver

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{QueryRequest, QueryResult};
use crate::services::config::TargetCatalog;
use crate::services::connection::ConnectionPoolRegistry;

/// Statement prefixes rejected by [`QueryGateway::validate_read_only`].
pub const FORBIDDEN_PREFIXES: &[&str] =
    &["INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER", "CREATE", "GRANT", "REVOKE"];

/// Entry point for all SQL sent to a target.
pub struct QueryGateway {
    catalog: Arc<TargetCatalog>,
    pools: Arc<ConnectionPoolRegistry>,
}

impl QueryGateway {
    /// Create a gateway over a catalog and pool registry.
    pub fn new(catalog: Arc<TargetCatalog>, pools: Arc<ConnectionPoolRegistry>) -> Self {
        Self { catalog, pools }
    }

    /// Reject statements that start with a write or DDL keyword.
    ///
    /// This is a prefix check, not a sandbox: writes hidden behind a CTE or
    /// a second statement are not detected.
    pub fn validate_read_only(sql: &str) -> QuarryResult<()> {
        let normalized = sql.trim().to_uppercase();
        match FORBIDDEN_PREFIXES.iter().find(|kw| normalized.starts_with(*kw)) {
            Some(keyword) => Err(QuarryError::validation(*keyword)),
            None => Ok(()),
        }
    }

    /// Append ` LIMIT n` unless the text already mentions LIMIT anywhere.
    ///
    /// Trailing whitespace and semicolons are stripped before appending. The
    /// LIMIT test is textual and also matches the word inside literals or
    /// comments.
    pub fn apply_limit(sql: &str, limit: Option<u64>) -> Cow<'_, str> {
        match limit {
            Some(n) if !sql.to_uppercase().contains("LIMIT") => {
                let body = sql.trim_end_matches(|c: char| c.is_whitespace() || c == ';');
                Cow::Owned(format!("{body} LIMIT {n}"))
            }
            _ => Cow::Borrowed(sql),
        }
    }

    /// Validate and run `sql` against the named target.
    pub async fn execute_query(
        &self,
        target_name: &str,
        sql: &str,
        limit: Option<u64>,
    ) -> QuarryResult<QueryResult> {
        Self::validate_read_only(sql)?;
        let target = self.catalog.get(target_name)?;
        let sql = Self::apply_limit(sql, limit);

        let start = Instant::now();
        tracing::debug!(target_name, driver = %target.driver, limit, "Executing query");

        let pool = self.pools.get_pool(target).await?;
        let result = pool.execute(&sql).await.inspect_err(|e| {
            tracing::warn!(target_name, error = %e, "Query failed");
        })?;

        tracing::debug!(
            target_name,
            execution_time_ms = start.elapsed().as_millis() as u64,
            row_count = result.row_count,
            "Query completed"
        );
        Ok(result)
    }

    /// Run a [`QueryRequest`].
    pub async fn execute(&self, request: &QueryRequest) -> QuarryResult<QueryResult> {
        self.execute_query(&request.target, &request.sql, request.limit).await
    }

    /// The targets this gateway serves.
    pub fn catalog(&self) -> &TargetCatalog {
        &self.catalog
    }
}
