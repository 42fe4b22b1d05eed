//! Application state management.
//!
//! [`Quarry`] owns every long-lived resource: the target catalog, SSH
//! tunnels, fallback marks and connection pools. Consumers create one per
//! process and call [`Quarry::close_all_pools`] before exiting.

use std::sync::{Arc, Weak};

use crate::error::QuarryResult;
use crate::models::{ColumnDescription, PoolStatus, QueryRequest, QueryResult};
use crate::services::config::{ConfigResolver, TargetCatalog};
use crate::services::connection::ConnectionPoolRegistry;
use crate::services::driver::{BackendFactory, DriverFactory, POOL_MAX_SIZE};
use crate::services::query::QueryGateway;
use crate::services::resolver::ConnectionResolver;
use crate::services::schema::SchemaIntrospector;
use crate::services::ssh::{RusshConnector, SshConnector};
use crate::services::tunnel::TunnelManager;

/// Read-only access to every configured database target.
pub struct Quarry {
    catalog: Arc<TargetCatalog>,
    tunnels: Arc<TunnelManager>,
    resolver: Arc<ConnectionResolver>,
    pools: Arc<ConnectionPoolRegistry>,
    gateway: Arc<QueryGateway>,
    schema: SchemaIntrospector,
}

impl Quarry {
    /// Create state from the process environment with real drivers and SSH.
    pub fn from_env() -> Self {
        Self::builder().catalog(ConfigResolver::from_process_env()).build()
    }

    /// Start building state with custom components.
    pub fn builder() -> QuarryBuilder {
        QuarryBuilder::default()
    }

    // ========== Public Operations ==========

    /// Names of all configured targets, sorted.
    pub fn list_databases(&self) -> Vec<String> {
        self.catalog.names().map(String::from).collect()
    }

    /// Tables of a target.
    pub async fn list_tables(&self, target_name: &str) -> QuarryResult<Vec<String>> {
        self.schema.list_tables(target_name).await
    }

    /// Columns of a table in a target.
    pub async fn describe_table(
        &self,
        target_name: &str,
        table: &str,
    ) -> QuarryResult<Vec<ColumnDescription>> {
        self.schema.describe_table(target_name, table).await
    }

    /// Run a read-only query, optionally capped with `LIMIT`.
    pub async fn query_database(
        &self,
        target_name: &str,
        sql: &str,
        limit: Option<u64>,
    ) -> QuarryResult<QueryResult> {
        self.gateway.execute_query(target_name, sql, limit).await
    }

    /// Run a [`QueryRequest`].
    pub async fn execute(&self, request: &QueryRequest) -> QuarryResult<QueryResult> {
        self.gateway.execute(request).await
    }

    /// Close every pool and then every tunnel. Safe to call repeatedly.
    pub async fn close_all_pools(&self) {
        tracing::debug!(
            pools = self.pools.pool_count(),
            tunnels = self.tunnels.tunnel_count(),
            "Closing all pools and tunnels"
        );
        self.pools.close_all().await;
        self.tunnels.close_all().await;
    }

    // ========== Introspection ==========

    /// Status of every open pool, ordered by target name.
    pub fn pool_statuses(&self) -> Vec<(String, PoolStatus)> {
        self.pools.statuses()
    }

    /// Number of open pools.
    pub fn pool_count(&self) -> usize {
        self.pools.pool_count()
    }

    /// Number of connecting or active tunnels.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.tunnel_count()
    }

    /// Whether a target has been switched to direct connections.
    pub fn is_fallback(&self, target_name: &str) -> bool {
        self.resolver.is_fallback(target_name)
    }

    /// The configured targets.
    pub fn catalog(&self) -> &TargetCatalog {
        &self.catalog
    }
}

/// Builder for [`Quarry`], used to swap in test doubles.
pub struct QuarryBuilder {
    catalog: TargetCatalog,
    connector: Option<Arc<dyn SshConnector>>,
    factory: Option<Arc<dyn BackendFactory>>,
    pool_size: usize,
}

impl Default for QuarryBuilder {
    fn default() -> Self {
        Self { catalog: TargetCatalog::default(), connector: None, factory: None, pool_size: POOL_MAX_SIZE }
    }
}

impl QuarryBuilder {
    /// Targets to serve.
    pub fn catalog(mut self, catalog: TargetCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// SSH connector for bastion sessions.
    pub fn connector(mut self, connector: Arc<dyn SshConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Factory for driver pools.
    pub fn factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Maximum connections per pool.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Wire the components together.
    pub fn build(self) -> Quarry {
        let catalog = Arc::new(self.catalog);
        let connector = self.connector.unwrap_or_else(|| Arc::new(RusshConnector::new()));
        let factory = self.factory.unwrap_or_else(|| Arc::new(DriverFactory));

        let tunnels = Arc::new(TunnelManager::new(connector));
        let resolver = Arc::new(ConnectionResolver::new(tunnels.clone()));
        let pools = Arc::new(ConnectionPoolRegistry::new(resolver.clone(), factory, self.pool_size));

        let registry: Weak<ConnectionPoolRegistry> = Arc::downgrade(&pools);
        tunnels.on_teardown(Arc::new(move |target_name| {
            if let Some(pools) = registry.upgrade() {
                pools.invalidate(target_name);
            }
        }));

        let gateway = Arc::new(QueryGateway::new(catalog.clone(), pools.clone()));
        let schema = SchemaIntrospector::new(gateway.clone());

        tracing::info!(targets = catalog.len(), pool_size = self.pool_size, "Quarry initialized");

        Quarry { catalog, tunnels, resolver, pools, gateway, schema }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseTarget, DriverKind};
    use crate::testing::{MockBackendFactory, MockConnector};

    fn quarry() -> Quarry {
        Quarry::builder()
            .catalog(TargetCatalog::from_targets([
                DatabaseTarget::new("odoo", DriverKind::Postgres, "pg"),
                DatabaseTarget::new("laravel", DriverKind::MySql, "my"),
            ]))
            .connector(Arc::new(MockConnector::new()))
            .factory(Arc::new(MockBackendFactory::new()))
            .build()
    }

    #[test]
    fn test_list_databases_sorted() {
        assert_eq!(quarry().list_databases(), ["laravel", "odoo"]);
    }

    #[tokio::test]
    async fn test_unknown_target_is_config_error() {
        let err = quarry().query_database("crm", "SELECT 1", None).await.unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("Available: laravel, odoo"));
    }

    #[tokio::test]
    async fn test_validation_runs_before_target_lookup() {
        let err = quarry().query_database("crm", "DROP TABLE x", None).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_execute_request_applies_limit() {
        let factory = Arc::new(MockBackendFactory::new());
        let quarry = Quarry::builder()
            .catalog(TargetCatalog::from_targets([DatabaseTarget::new("odoo", DriverKind::Postgres, "pg")]))
            .connector(Arc::new(MockConnector::new()))
            .factory(factory.clone())
            .build();

        let mut request = QueryRequest::new("odoo", "SELECT name FROM res_partner;");
        request.limit = Some(3);
        quarry.execute(&request).await.unwrap();

        assert_eq!(
            factory.executed(),
            vec![("odoo".to_string(), "SELECT name FROM res_partner LIMIT 3".to_string())]
        );
    }

    #[tokio::test]
    async fn test_pool_statuses_after_query() {
        let quarry = quarry();
        quarry.query_database("odoo", "SELECT 1", None).await.unwrap();

        let statuses = quarry.pool_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].0, "odoo");
        assert_eq!(statuses[0].1.max_size, POOL_MAX_SIZE);
        assert!(!statuses[0].1.via_tunnel);
    }
}
