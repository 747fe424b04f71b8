//! Connection pool integration tests against a live MySQL server

use std::sync::Arc;

use athena_ha::driver::{DbHandle, MySqlDriver};
use athena_ha::pool::ConnectionPoolRegistry;

use crate::{get_mysql_config, skip_if_not_enabled};

const TEST_TABLE: &str = "athena_ha_it_pool";

fn create_registry() -> ConnectionPoolRegistry {
    ConnectionPoolRegistry::new(Arc::new(MySqlDriver))
}

async fn reset_table(handle: &dyn DbHandle) {
    handle
        .execute(&format!("DROP TABLE IF EXISTS {}", TEST_TABLE))
        .await
        .expect("DROP should succeed");
    handle
        .execute(&format!(
            "CREATE TABLE {} (id INT PRIMARY KEY AUTO_INCREMENT, name VARCHAR(64)) ENGINE=InnoDB",
            TEST_TABLE
        ))
        .await
        .expect("CREATE should succeed");
}

#[tokio::test]
async fn test_create_query_destroy() {
    skip_if_not_enabled!();

    let mysql = get_mysql_config();
    let registry = create_registry();

    let pool = registry
        .create_connection_pool(mysql.database_config())
        .await
        .expect("pool creation should succeed");
    assert_eq!(pool.database_id, mysql.addr());
    assert_eq!(registry.get_connection_pool(&pool.id).unwrap().id, pool.id);

    let rs = pool.handle.query("SELECT 1 AS one").await.expect("SELECT should succeed");
    assert_eq!(rs.first_value("one"), Some("1"));

    let stats = registry.refresh_stats(&pool.id).unwrap();
    assert_eq!(stats.max_open_connections, 4);
    assert!(stats.open_connections >= 1);

    registry.destroy_connection_pool(&pool.id).await.unwrap();
    assert!(registry.get_connection_pool(&pool.id).is_err());
}

#[tokio::test]
async fn test_unreachable_server_is_rejected() {
    skip_if_not_enabled!();

    let mut config = get_mysql_config().database_config();
    // Nothing listens on the discard port
    config.port = 9;
    config.connect_timeout_ms = 500;

    let registry = create_registry();
    assert!(registry.create_connection_pool(config).await.is_err());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_execute_and_transaction() {
    skip_if_not_enabled!();

    let registry = create_registry();
    let pool = registry
        .create_connection_pool(get_mysql_config().database_config())
        .await
        .expect("pool creation should succeed");
    let handle = pool.handle.clone();
    reset_table(handle.as_ref()).await;

    let result = handle
        .execute(&format!("INSERT INTO {} (name) VALUES ('a')", TEST_TABLE))
        .await
        .expect("INSERT should succeed");
    assert_eq!(result.rows_affected, 1);
    assert_eq!(result.last_insert_id, 1);

    let mut tx = handle.begin().await.expect("BEGIN should succeed");
    tx.execute(&format!("INSERT INTO {} (name) VALUES ('rolled back')", TEST_TABLE))
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    let mut tx = handle.begin().await.expect("BEGIN should succeed");
    tx.execute(&format!("INSERT INTO {} (name) VALUES ('committed')", TEST_TABLE))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let rs = handle
        .query(&format!("SELECT COUNT(*) AS n FROM {}", TEST_TABLE))
        .await
        .unwrap();
    assert_eq!(rs.first_value("n"), Some("2"));

    handle
        .execute(&format!("DROP TABLE {}", TEST_TABLE))
        .await
        .unwrap();
    registry.destroy_connection_pool(&pool.id).await.unwrap();
}

#[tokio::test]
async fn test_server_error_is_reported() {
    skip_if_not_enabled!();

    let registry = create_registry();
    let pool = registry
        .create_connection_pool(get_mysql_config().database_config())
        .await
        .unwrap();

    let err = pool
        .handle
        .query("SELECT * FROM athena_ha_no_such_table")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("1146"), "unexpected error: {}", err);

    // The pool stays usable after a statement error
    pool.handle.ping().await.unwrap();
    registry.destroy_connection_pool(&pool.id).await.unwrap();
}

#[tokio::test]
async fn test_standalone_server_reports_no_lag() {
    skip_if_not_enabled!();

    let registry = create_registry();
    let pool = registry
        .create_connection_pool(get_mysql_config().database_config())
        .await
        .unwrap();

    // A server that is not a replica returns an empty status row set
    let lag = pool.handle.replication_lag().await.unwrap();
    assert_eq!(lag, None);
    registry.destroy_connection_pool(&pool.id).await.unwrap();
}
