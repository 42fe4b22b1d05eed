//! PostgreSQL backend on deadpool-postgres.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde_json::Value;
use std::error::Error;
use std::time::Duration;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::NoTls;

use super::{quote_literal, Backend, Dialect, CONNECT_TIMEOUT};
use crate::error::{QuarryError, QuarryResult};
use crate::models::{
    ColumnDescription, DatabaseTarget, DriverKind, PoolStatus, QueryResult, ResolvedEndpoint, Row,
};

/// How long a query waits for a free pooled connection.
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// A deadpool-postgres pool bound to one endpoint.
pub struct PostgresBackend {
    target_name: String,
    pool: Pool,
    via_tunnel: bool,
}

impl PostgresBackend {
    /// Create a pool for `target` against `endpoint`.
    pub fn new(
        target: &DatabaseTarget,
        endpoint: &ResolvedEndpoint,
        max_size: usize,
    ) -> QuarryResult<Self> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&endpoint.host);
        pg_config.port(endpoint.port);
        pg_config.dbname(&target.database);
        pg_config.user(&target.username);
        pg_config.password(&target.password);
        pg_config.application_name("quarry");
        pg_config.connect_timeout(CONNECT_TIMEOUT);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );

        let pool = Pool::builder(manager)
            .max_size(max_size)
            .wait_timeout(Some(WAIT_TIMEOUT))
            .create_timeout(Some(CONNECT_TIMEOUT))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| QuarryError::driver(format!("Failed to create pool: {e}")))?;

        tracing::info!(
            target_name = %target.name,
            host = %endpoint.host,
            port = endpoint.port,
            database = %target.database,
            via_tunnel = endpoint.via_tunnel(),
            "PostgreSQL pool created"
        );

        Ok(Self { target_name: target.name.clone(), pool, via_tunnel: endpoint.via_tunnel() })
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    fn driver(&self) -> DriverKind {
        DriverKind::Postgres
    }

    async fn execute(&self, sql: &str) -> QuarryResult<QueryResult> {
        let client = self.pool.get().await?;
        let statement = client.prepare(sql).await?;
        let columns: Vec<String> =
            statement.columns().iter().map(|c| c.name().to_string()).collect();

        let rows = client.query(&statement, &[]).await?;
        let rows: Vec<Row> = rows.iter().map(row_to_json).collect();

        Ok(QueryResult::new(columns, rows))
    }

    fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: status.available,
            waiting: status.waiting,
            via_tunnel: self.via_tunnel,
        }
    }

    async fn close(&self) {
        self.pool.close();
        tracing::info!(target_name = %self.target_name, "PostgreSQL pool closed");
    }
}

/// Convert one row into a column-ordered JSON map.
fn row_to_json(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| (column.name().to_string(), cell_to_json(row, idx, column.type_())))
        .collect()
}

fn get<'a, T: FromSql<'a>>(
    row: &'a tokio_postgres::Row,
    idx: usize,
    convert: impl FnOnce(T) -> Value,
) -> Value {
    match row.try_get::<_, Option<T>>(idx) {
        Ok(Some(value)) => convert(value),
        Ok(None) => Value::Null,
        Err(e) => {
            tracing::debug!(column = idx, error = %e, "Unconvertible PostgreSQL value");
            Value::Null
        }
    }
}

fn cell_to_json(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
    match *ty {
        Type::BOOL => get(row, idx, Value::Bool),
        Type::INT2 => get::<i16>(row, idx, Value::from),
        Type::INT4 => get::<i32>(row, idx, Value::from),
        Type::INT8 => get::<i64>(row, idx, Value::from),
        Type::OID => get::<u32>(row, idx, Value::from),
        Type::FLOAT4 => get::<f32>(row, idx, |f| Value::from(f as f64)),
        Type::FLOAT8 => get::<f64>(row, idx, Value::from),
        Type::NUMERIC => get::<rust_decimal::Decimal>(row, idx, |d| Value::String(d.to_string())),
        Type::JSON | Type::JSONB => get::<Value>(row, idx, |v| v),
        Type::DATE => get::<chrono::NaiveDate>(row, idx, |d| Value::String(d.to_string())),
        Type::TIME => get::<chrono::NaiveTime>(row, idx, |t| Value::String(t.to_string())),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx, |ts| {
            Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }),
        Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, idx, |ts| {
            Value::String(ts.to_rfc3339())
        }),
        Type::UUID => get::<uuid::Uuid>(row, idx, |u| Value::String(u.to_string())),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
            get::<Vec<Option<String>>>(row, idx, |items| Value::from(items))
        }
        Type::INT4_ARRAY => get::<Vec<Option<i32>>>(row, idx, |items| Value::from(items)),
        Type::INT8_ARRAY => get::<Vec<Option<i64>>>(row, idx, |items| Value::from(items)),
        Type::BYTEA => get::<&[u8]>(row, idx, |bytes| Value::from(bytes.to_vec())),
        _ => get::<LossyText>(row, idx, |text| Value::String(text.0)),
    }
}

/// Raw column bytes read as UTF-8 for types whose binary form is text.
///
/// Anything else (intervals, network types, geometry) is rejected and the
/// cell becomes `null`.
struct LossyText(String);

impl<'a> FromSql<'a> for LossyText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(Self(String::from_utf8_lossy(raw).into_owned()))
    }

    fn accepts(ty: &Type) -> bool {
        match ty.kind() {
            Kind::Enum(_) => true,
            Kind::Domain(base) => <Self as FromSql<'a>>::accepts(base),
            _ => {
                matches!(*ty, Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN)
                    || ty.name() == "citext"
            }
        }
    }
}

/// Catalog queries for PostgreSQL, scoped to the `public` schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn list_tables_sql(&self) -> String {
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = 'public' ORDER BY table_name"
            .to_string()
    }

    fn describe_table_sql(&self, table: &str) -> String {
        format!(
            r#"
            SELECT
                a.attname AS column,
                pg_catalog.format_type(a.atttypid, a.atttypmod) AS type,
                NOT a.attnotnull AS nullable
            FROM pg_catalog.pg_attribute a
            JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = 'public'
              AND c.relname = {}
              AND a.attnum > 0
              AND NOT a.attisdropped
            ORDER BY a.attnum
            "#,
            quote_literal(table)
        )
    }

    fn parse_tables(&self, result: &QueryResult) -> Vec<String> {
        (0..result.row_count)
            .filter_map(|i| result.str_at(i, "table_name").map(String::from))
            .collect()
    }

    fn parse_columns(&self, result: &QueryResult) -> Vec<ColumnDescription> {
        result
            .rows
            .iter()
            .filter_map(|row| {
                let column = row.get("column")?.as_str()?;
                let data_type = row.get("type").and_then(Value::as_str).unwrap_or_default();
                let nullable = row.get("nullable").and_then(Value::as_bool).unwrap_or(false);
                Some(ColumnDescription::new(column, data_type, nullable))
            })
            .collect()
    }
}
