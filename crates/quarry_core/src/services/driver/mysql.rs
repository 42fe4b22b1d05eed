//! MySQL backend on mysql_async.

use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{OptsBuilder, Pool, PoolConstraints, PoolOpts};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Backend, Dialect, CONNECT_TIMEOUT};
use crate::error::{QuarryError, QuarryResult};
use crate::models::{
    ColumnDescription, DatabaseTarget, DriverKind, PoolStatus, QueryResult, ResolvedEndpoint, Row,
};

/// A mysql_async pool bound to one endpoint.
///
/// mysql_async does not expose idle counts, so [`Backend::status`] reports
/// in-flight queries as the pool size.
pub struct MySqlBackend {
    target_name: String,
    pool: Pool,
    max_size: usize,
    in_flight: AtomicUsize,
    via_tunnel: bool,
}

impl MySqlBackend {
    /// Create a pool for `target` against `endpoint`.
    pub fn new(
        target: &DatabaseTarget,
        endpoint: &ResolvedEndpoint,
        max_size: usize,
    ) -> QuarryResult<Self> {
        let constraints = PoolConstraints::new(0, max_size).ok_or_else(|| {
            QuarryError::config(format!("Invalid pool size {max_size} for '{}'", target.name))
        })?;

        let opts = OptsBuilder::default()
            .ip_or_hostname(endpoint.host.clone())
            .tcp_port(endpoint.port)
            .user(Some(target.username.clone()))
            .pass(Some(target.password.clone()))
            .db_name(Some(target.database.clone()))
            .pool_opts(PoolOpts::default().with_constraints(constraints));

        tracing::info!(
            target_name = %target.name,
            host = %endpoint.host,
            port = endpoint.port,
            database = %target.database,
            via_tunnel = endpoint.via_tunnel(),
            "MySQL pool created"
        );

        Ok(Self {
            target_name: target.name.clone(),
            pool: Pool::new(opts),
            max_size,
            in_flight: AtomicUsize::new(0),
            via_tunnel: endpoint.via_tunnel(),
        })
    }

    async fn run(&self, sql: &str) -> QuarryResult<QueryResult> {
        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, self.pool.get_conn())
            .await
            .map_err(|_| {
                QuarryError::driver(format!(
                    "Timed out connecting to MySQL for '{}'",
                    self.target_name
                ))
            })??;

        let mut result = conn.query_iter(sql).await?;
        let columns = result.columns().map(|c| c.to_vec()).unwrap_or_default();
        let raw: Vec<mysql_async::Row> = result.collect().await?;
        drop(result);

        let names: Vec<String> = columns.iter().map(|c| c.name_str().to_string()).collect();
        let rows: Vec<Row> = raw
            .into_iter()
            .map(|mut row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| {
                        let value = row.take(idx).unwrap_or(mysql_async::Value::NULL);
                        (column.name_str().to_string(), cell_to_json(value, column.column_type()))
                    })
                    .collect()
            })
            .collect();

        Ok(QueryResult::new(names, rows))
    }
}

#[async_trait]
impl Backend for MySqlBackend {
    fn driver(&self) -> DriverKind {
        DriverKind::MySql
    }

    async fn execute(&self, sql: &str) -> QuarryResult<QueryResult> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.run(sql).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn status(&self) -> PoolStatus {
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        PoolStatus {
            max_size: self.max_size,
            size: in_flight.min(self.max_size),
            available: 0,
            waiting: in_flight.saturating_sub(self.max_size),
            via_tunnel: self.via_tunnel,
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pool.clone().disconnect().await {
            tracing::debug!(target_name = %self.target_name, error = %e, "MySQL pool disconnect");
        }
        tracing::info!(target_name = %self.target_name, "MySQL pool closed");
    }
}

/// Convert one text-protocol value using its column type.
///
/// The text protocol delivers every non-null cell as bytes; numeric columns
/// are parsed back into JSON numbers. DECIMAL stays a string to keep precision.
fn cell_to_json(value: mysql_async::Value, column_type: ColumnType) -> Value {
    use mysql_async::Value as My;

    match value {
        My::NULL => Value::Null,
        My::Int(n) => Value::from(n),
        My::UInt(n) => Value::from(n),
        My::Float(f) => Value::from(f as f64),
        My::Double(d) => Value::from(d),
        My::Bytes(bytes) => bytes_to_json(bytes, column_type),
        date @ My::Date(..) | date @ My::Time(..) => {
            Value::String(date.as_sql(true).trim_matches('\'').to_string())
        }
    }
}

fn bytes_to_json(bytes: Vec<u8>, column_type: ColumnType) -> Value {
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => return Value::String(String::from_utf8_lossy(e.as_bytes()).into_owned()),
    };

    let number = match column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => text
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| text.parse::<u64>().map(Value::from))
            .ok(),
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => {
            text.parse::<f64>().ok().map(Value::from)
        }
        ColumnType::MYSQL_TYPE_JSON => serde_json::from_str(&text).ok(),
        _ => None,
    };

    number.unwrap_or(Value::String(text))
}

/// Catalog queries for MySQL, against the connection's default database.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn list_tables_sql(&self) -> String {
        "SHOW TABLES".to_string()
    }

    fn describe_table_sql(&self, table: &str) -> String {
        format!("SHOW COLUMNS FROM `{}`", table.replace('`', "``"))
    }

    fn parse_tables(&self, result: &QueryResult) -> Vec<String> {
        // The single column is named `Tables_in_<database>`
        let Some(column) = result.columns.first() else {
            return Vec::new();
        };
        (0..result.row_count)
            .filter_map(|i| result.str_at(i, column).map(String::from))
            .collect()
    }

    fn parse_columns(&self, result: &QueryResult) -> Vec<ColumnDescription> {
        (0..result.row_count)
            .filter_map(|i| {
                let column = result.str_at(i, "Field")?;
                let data_type = result.str_at(i, "Type").unwrap_or_default();
                let nullable = result.str_at(i, "Null") == Some("YES");
                Some(ColumnDescription::new(column, data_type, nullable))
            })
            .collect()
    }
}
