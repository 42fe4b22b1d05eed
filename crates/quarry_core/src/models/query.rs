//! Query request and result models.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single row keyed by column name, in column order.
pub type Row = Map<String, Value>;

/// A read-only query against a named target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Target name
    pub target: String,
    /// SQL text
    pub sql: String,
    /// Optional row limit appended when the query has none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl QueryRequest {
    /// Create a request without a limit.
    pub fn new(target: impl Into<String>, sql: impl Into<String>) -> Self {
        Self { target: target.into(), sql: sql.into(), limit: None }
    }
}

/// Results from query execution, normalized across drivers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Column names in result order
    pub columns: Vec<String>,
    /// Result rows
    pub rows: Vec<Row>,
    /// Number of rows returned
    pub row_count: usize,
}

impl QueryResult {
    /// Build a result, deriving the row count.
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let row_count = rows.len();
        Self { columns, rows, row_count }
    }

    /// Get a cell as a string slice, if it is a JSON string.
    pub fn str_at(&self, row: usize, column: &str) -> Option<&str> {
        self.rows.get(row)?.get(column)?.as_str()
    }
}
