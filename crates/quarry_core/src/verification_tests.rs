//! End-to-end behavior checks for the access layer.
//!
//! Each test drives a full [`Quarry`] with the in-crate SSH and driver
//! doubles:
//! - Concurrent first queries share one tunnel and one pool
//! - Failed tunnels fall back to direct connections for good
//! - Read-only guard and LIMIT injection reach the driver as expected
//! - Catalog results are normalized per dialect
//! - Tunnel loss discards the pool; shutdown is idempotent and leaves
//!   nothing behind when it interrupts a connecting tunnel

#[cfg(test)]
mod tests {
    use crate::error::QuarryError;
    use crate::models::{ColumnDescription, DatabaseTarget, DriverKind, QueryResult, Row};
    use crate::services::config::TargetCatalog;
    use crate::state::Quarry;
    use crate::testing::{ssh_target, MockBackendFactory, MockConnector};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn rows(values: Vec<Value>) -> Vec<Row> {
        values
            .into_iter()
            .map(|v| match v {
                Value::Object(map) => map,
                other => panic!("expected object, got {other}"),
            })
            .collect()
    }

    fn result(columns: &[&str], values: Vec<Value>) -> QueryResult {
        QueryResult::new(columns.iter().map(|c| c.to_string()).collect(), rows(values))
    }

    fn quarry_with(
        targets: Vec<DatabaseTarget>,
        connector: Arc<MockConnector>,
        factory: Arc<MockBackendFactory>,
    ) -> Quarry {
        Quarry::builder()
            .catalog(TargetCatalog::from_targets(targets))
            .connector(connector)
            .factory(factory)
            .build()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // =========================================================================
    // Concurrency
    // =========================================================================

    #[tokio::test]
    async fn test_concurrent_first_queries_share_tunnel_and_pool() {
        let connector = Arc::new(MockConnector::new().with_delay(Duration::from_millis(50)));
        let factory = Arc::new(MockBackendFactory::new());
        let quarry =
            Arc::new(quarry_with(vec![ssh_target("odoo")], connector.clone(), factory.clone()));

        let queries = (0..10).map(|_| {
            let quarry = quarry.clone();
            tokio::spawn(async move { quarry.query_database("odoo", "SELECT 1", None).await })
        });
        for joined in futures_util::future::join_all(queries).await {
            joined.unwrap().unwrap();
        }

        assert_eq!(connector.connect_count(), 1);
        assert_eq!(quarry.tunnel_count(), 1);
        assert_eq!(factory.created_count(), 1);
        assert_eq!(factory.executed().len(), 10);

        let (_, endpoint) = &factory.endpoints()[0];
        assert_eq!(endpoint.host, "127.0.0.1");
        assert!(endpoint.via_tunnel());

        quarry.close_all_pools().await;
    }

    #[tokio::test]
    async fn test_concurrent_first_queries_share_one_failed_attempt() {
        let connector = Arc::new(MockConnector::failing().with_delay(Duration::from_millis(30)));
        let factory = Arc::new(MockBackendFactory::new());
        let quarry =
            Arc::new(quarry_with(vec![ssh_target("laravel")], connector.clone(), factory.clone()));

        let queries = (0..10).map(|_| {
            let quarry = quarry.clone();
            tokio::spawn(async move { quarry.query_database("laravel", "SELECT 1", None).await })
        });
        for joined in futures_util::future::join_all(queries).await {
            joined.unwrap().unwrap();
        }

        assert_eq!(connector.connect_count(), 1);
        assert_eq!(quarry.tunnel_count(), 0);
        assert_eq!(factory.created_count(), 1);
    }

    // =========================================================================
    // Fallback
    // =========================================================================

    #[tokio::test]
    async fn test_failed_tunnel_falls_back_permanently() {
        let connector = Arc::new(MockConnector::failing());
        let factory = Arc::new(MockBackendFactory::new());
        let quarry = quarry_with(vec![ssh_target("laravel")], connector.clone(), factory.clone());

        quarry.query_database("laravel", "SELECT 1", None).await.unwrap();
        assert!(quarry.is_fallback("laravel"));

        // Drop the pool so the second query has to resolve again
        quarry.close_all_pools().await;
        quarry.query_database("laravel", "SELECT 2", None).await.unwrap();

        assert_eq!(connector.connect_count(), 1);
        let endpoints = factory.endpoints();
        assert_eq!(endpoints.len(), 2);
        for (_, endpoint) in endpoints {
            assert_eq!(endpoint.host, "db.internal");
            assert_eq!(endpoint.port, 3306);
            assert!(!endpoint.via_tunnel());
        }
    }

    #[tokio::test]
    async fn test_tunnel_loss_does_not_mark_fallback() {
        let connector = Arc::new(MockConnector::new());
        let factory = Arc::new(MockBackendFactory::new());
        let quarry = quarry_with(vec![ssh_target("odoo")], connector.clone(), factory.clone());

        quarry.query_database("odoo", "SELECT 1", None).await.unwrap();
        connector.end_sessions();
        wait_until(|| quarry.tunnel_count() == 0).await;

        assert!(!quarry.is_fallback("odoo"));
    }

    // =========================================================================
    // Tunnel teardown
    // =========================================================================

    #[tokio::test]
    async fn test_tunnel_teardown_discards_pool_and_rebuilds() {
        let connector = Arc::new(MockConnector::new());
        let factory = Arc::new(MockBackendFactory::new());
        let quarry = quarry_with(vec![ssh_target("odoo")], connector.clone(), factory.clone());

        quarry.query_database("odoo", "SELECT 1", None).await.unwrap();
        assert_eq!(quarry.pool_count(), 1);

        connector.end_sessions();
        wait_until(|| quarry.pool_count() == 0).await;
        wait_until(|| factory.closed_count() == 1).await;
        assert_eq!(quarry.tunnel_count(), 0);

        quarry.query_database("odoo", "SELECT 1", None).await.unwrap();
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(factory.created_count(), 2);

        let endpoints = factory.endpoints();
        let first = endpoints[0].1.tunnel.unwrap();
        let second = endpoints[1].1.tunnel.unwrap();
        assert_ne!(first.generation, second.generation);
    }

    // =========================================================================
    // Query gateway
    // =========================================================================

    #[tokio::test]
    async fn test_write_statements_never_reach_a_pool() {
        let factory = Arc::new(MockBackendFactory::new());
        let quarry = quarry_with(
            vec![DatabaseTarget::new("odoo", DriverKind::Postgres, "pg")],
            Arc::new(MockConnector::new()),
            factory.clone(),
        );

        for sql in ["  update foo set a=1", "INSERT INTO x VALUES (1)"] {
            let err = quarry.query_database("odoo", sql, None).await.unwrap_err();
            assert!(err.is_validation());
            assert_eq!(err.to_error_info().error_type, "Validation Error");
        }
        assert_eq!(quarry.pool_count(), 0);
        assert!(factory.executed().is_empty());

        quarry.query_database("odoo", "SELECT 1", None).await.unwrap();
        assert_eq!(factory.executed(), vec![("odoo".to_string(), "SELECT 1".to_string())]);
    }

    #[tokio::test]
    async fn test_limit_injection_reaches_driver() {
        let factory = Arc::new(MockBackendFactory::new());
        let quarry = quarry_with(
            vec![DatabaseTarget::new("odoo", DriverKind::Postgres, "pg")],
            Arc::new(MockConnector::new()),
            factory.clone(),
        );

        quarry.query_database("odoo", "SELECT id FROM purchase_order", Some(5)).await.unwrap();
        quarry.query_database("odoo", "SELECT id FROM t LIMIT 10", Some(5)).await.unwrap();

        let executed: Vec<String> = factory.executed().into_iter().map(|(_, sql)| sql).collect();
        assert_eq!(executed, ["SELECT id FROM purchase_order LIMIT 5", "SELECT id FROM t LIMIT 10"]);
    }

    #[tokio::test]
    async fn test_driver_errors_surface_with_server_detail() {
        let factory = MockBackendFactory::with_responder(|_, _| {
            Err(QuarryError::Driver {
                message: "relation \"nope\" does not exist".to_string(),
                code: Some("42P01".to_string()),
                detail: None,
                hint: None,
                source: None,
            })
        });
        let quarry = quarry_with(
            vec![DatabaseTarget::new("odoo", DriverKind::Postgres, "pg")],
            Arc::new(MockConnector::new()),
            Arc::new(factory),
        );

        let err = quarry.query_database("odoo", "SELECT * FROM nope", None).await.unwrap_err();
        assert_eq!(err.code(), Some("42P01"));
        assert_eq!(err.category(), "Driver");
    }

    // =========================================================================
    // Schema introspection
    // =========================================================================

    #[tokio::test]
    async fn test_describe_postgres_table_reports_nullability() {
        let factory = MockBackendFactory::with_responder(|_, sql| {
            assert!(sql.contains("c.relname = 'purchase_order'"));
            Ok(result(
                &["column", "type", "nullable"],
                vec![
                    json!({"column": "id", "type": "integer", "nullable": false}),
                    json!({"column": "partner_ref", "type": "character varying", "nullable": true}),
                ],
            ))
        });
        let quarry = quarry_with(
            vec![DatabaseTarget::new("odoo", DriverKind::Postgres, "pg")],
            Arc::new(MockConnector::new()),
            Arc::new(factory),
        );

        let columns = quarry.describe_table("odoo", "purchase_order").await.unwrap();
        assert_eq!(
            columns,
            vec![
                ColumnDescription::new("id", "integer", false),
                ColumnDescription::new("partner_ref", "character varying", true),
            ]
        );
    }

    #[tokio::test]
    async fn test_describe_mysql_table_maps_yes_no() {
        let factory = MockBackendFactory::with_responder(|_, sql| {
            assert_eq!(sql, "SHOW COLUMNS FROM `users`");
            Ok(result(
                &["Field", "Type", "Null"],
                vec![
                    json!({"Field": "id", "Type": "bigint unsigned", "Null": "NO"}),
                    json!({"Field": "remember_token", "Type": "varchar(100)", "Null": "YES"}),
                ],
            ))
        });
        let quarry = quarry_with(
            vec![DatabaseTarget::new("laravel", DriverKind::MySql, "my")],
            Arc::new(MockConnector::new()),
            Arc::new(factory),
        );

        let columns = quarry.describe_table("laravel", "users").await.unwrap();
        assert!(!columns[0].nullable);
        assert!(columns[1].nullable);
    }

    #[tokio::test]
    async fn test_list_tables_per_dialect() {
        let factory = MockBackendFactory::with_responder(|target, sql| {
            if target == "laravel" {
                assert_eq!(sql, DriverKind::MySql.dialect().list_tables_sql());
                Ok(result(&["Tables_in_app"], vec![json!({"Tables_in_app": "users"})]))
            } else {
                assert!(sql.contains("table_schema = 'public'"));
                Ok(result(&["table_name"], vec![json!({"table_name": "res_partner"})]))
            }
        });
        let quarry = quarry_with(
            vec![
                DatabaseTarget::new("laravel", DriverKind::MySql, "my"),
                DatabaseTarget::new("odoo", DriverKind::Postgres, "pg"),
            ],
            Arc::new(MockConnector::new()),
            Arc::new(factory),
        );

        assert_eq!(quarry.list_tables("laravel").await.unwrap(), ["users"]);
        assert_eq!(quarry.list_tables("odoo").await.unwrap(), ["res_partner"]);

        let err = quarry.list_tables("crm").await.unwrap_err();
        assert!(err.is_config());
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    #[tokio::test]
    async fn test_close_all_pools_twice() {
        let connector = Arc::new(MockConnector::new());
        let factory = Arc::new(MockBackendFactory::new());
        let quarry = quarry_with(
            vec![ssh_target("odoo"), ssh_target("laravel")],
            connector.clone(),
            factory.clone(),
        );

        quarry.query_database("odoo", "SELECT 1", None).await.unwrap();
        quarry.query_database("laravel", "SELECT 1", None).await.unwrap();
        assert_eq!(quarry.tunnel_count(), 2);

        quarry.close_all_pools().await;
        quarry.close_all_pools().await;

        assert_eq!(quarry.pool_count(), 0);
        assert_eq!(quarry.tunnel_count(), 0);
        assert_eq!(factory.closed_count(), 2);
        assert_eq!(connector.close_count(), 2);
    }

    #[tokio::test]
    async fn test_close_during_tunnel_setup_leaves_nothing_open() {
        let connector = Arc::new(MockConnector::new().with_delay(Duration::from_millis(200)));
        let factory = Arc::new(MockBackendFactory::new());
        let quarry =
            Arc::new(quarry_with(vec![ssh_target("odoo")], connector.clone(), factory.clone()));

        let pending = {
            let quarry = quarry.clone();
            tokio::spawn(async move { quarry.query_database("odoo", "SELECT 1", None).await })
        };
        wait_until(|| connector.connect_count() == 1).await;

        quarry.close_all_pools().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_shutdown());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!quarry.is_fallback("odoo"));
        assert_eq!(quarry.pool_count(), 0);
        assert_eq!(quarry.tunnel_count(), 0);
        assert!(factory.endpoints().is_empty());

        // The target still tunnels on the next query
        quarry.query_database("odoo", "SELECT 1", None).await.unwrap();
        assert!(factory.endpoints()[0].1.via_tunnel());
        quarry.close_all_pools().await;
    }

    // =========================================================================
    // Secrets
    // =========================================================================

    #[test]
    fn test_debug_output_never_contains_password() {
        let mut target = ssh_target("odoo");
        target.password = "s3cret-pw".to_string();
        if let Some(ssh) = target.ssh.as_mut() {
            ssh.key_passphrase = Some("key-phrase".to_string());
        }

        let debug = format!("{target:?}");
        assert!(!debug.contains("s3cret-pw"));
        assert!(!debug.contains("key-phrase"));
        assert!(!target.display_url().contains("s3cret-pw"));
    }
}
