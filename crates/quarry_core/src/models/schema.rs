//! Schema introspection models.

use serde::{Deserialize, Serialize};

/// One column of a described table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    /// Column name
    pub column: String,
    /// Column type as reported by the catalog
    #[serde(rename = "type")]
    pub data_type: String,
    /// Whether the column accepts NULL
    pub nullable: bool,
}

impl ColumnDescription {
    /// Create a column description.
    pub fn new(column: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self { column: column.into(), data_type: data_type.into(), nullable }
    }
}
