//! Health checking through the service facade against a live MySQL server

use std::sync::Arc;

use athena_ha::config::parse_config;
use athena_ha::driver::MySqlDriver;
use athena_ha::instance::InstanceStatus;
use athena_ha::HaService;

use crate::{get_mysql_config, skip_if_not_enabled};

async fn create_service() -> HaService {
    let mysql = get_mysql_config();
    let toml = format!(
        r#"
[[instances]]
id = "primary"
host = "{host}"
port = {port}
user = "{user}"
password = "{password}"
database = "{database}"
role = "primary"

[[instances]]
id = "ghost"
host = "127.0.0.1"
port = 9
user = "{user}"

[pool_defaults]
connect_timeout_ms = 500

[[clusters]]
id = "it"
primary = "primary"
replicas = ["ghost"]
"#,
        host = mysql.host,
        port = mysql.port,
        user = mysql.user,
        password = mysql.password,
        database = mysql.database,
    );
    let config = parse_config(&toml).expect("test config should parse");

    let service = HaService::new(&config, Arc::new(MySqlDriver));
    service.bootstrap(&config).await.expect("bootstrap should succeed");
    service
}

#[tokio::test]
async fn test_round_marks_live_primary_healthy() {
    skip_if_not_enabled!();

    let service = create_service().await;

    let health = service.check_database_health("primary").await.unwrap();
    assert!(health.is_connected);
    assert_eq!(health.consecutive_fails, 0);
    assert_eq!(
        service.get_database_instance("primary").unwrap().status,
        InstanceStatus::Healthy
    );

    let ghost = service.check_database_health("ghost").await.unwrap();
    assert!(!ghost.is_connected);
    assert_eq!(ghost.last_error.as_deref(), Some("no connection pool found"));

    let cluster = service.update_cluster_health("it").unwrap();
    assert!(cluster.primary_healthy);
    assert_eq!(cluster.replicas_healthy, 0);
    assert_eq!(cluster.connection_pools, 1);

    let report = service.health_report();
    assert_eq!(report.total_instances, 2);
    assert_eq!(report.healthy_instances, 1);
    assert!((report.overall_health_score - 50.0).abs() < f64::EPSILON);

    service.shutdown().await;
}

#[tokio::test]
async fn test_failover_without_healthy_replica_is_refused() {
    skip_if_not_enabled!();

    let service = create_service().await;
    service.check_database_health("primary").await.unwrap();
    service.check_database_health("ghost").await.unwrap();

    let err = service.trigger_failover("it").unwrap_err();
    assert_eq!(err.to_string(), "no healthy replica found for promotion");
    assert_eq!(service.get_database_cluster("it").unwrap().primary, "primary");

    service.shutdown().await;
}

#[tokio::test]
async fn test_rw_and_ro_connections_use_primary() {
    skip_if_not_enabled!();

    let service = create_service().await;
    service.check_database_health("primary").await.unwrap();

    let rw = service.get_read_write_connection("it").await.unwrap();
    rw.ping().await.unwrap();
    // The only replica has no pool, so reads fall back to the primary
    let ro = service.get_read_only_connection("it").await.unwrap();
    assert!(Arc::ptr_eq(&rw, &ro));

    let pool_id = service.get_all_connection_pools()[0].id.clone();
    service.execute_query(&pool_id, "SELECT 1").await.unwrap();
    let metrics = service.get_database_metrics();
    assert_eq!(metrics.total_queries, 1);
    assert_eq!(metrics.read_queries, 1);

    service.shutdown().await;
}
