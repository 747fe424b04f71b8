//! Integration test entry point
//!
//! Run with: ATHENA_HA_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! Environment variables:
//! - ATHENA_HA_RUN_INTEGRATION_TESTS: Set to "1" to enable integration tests
//! - ATHENA_HA_TEST_MYSQL_HOST: MySQL host (default: 127.0.0.1)
//! - ATHENA_HA_TEST_MYSQL_PORT: MySQL port (default: 3306)
//! - ATHENA_HA_TEST_MYSQL_USER: MySQL user (default: root)
//! - ATHENA_HA_TEST_MYSQL_PASS: MySQL password (default: empty)
//! - ATHENA_HA_TEST_MYSQL_DB: Database for scratch tables (default: test)

mod health;
mod pools;

use std::env;

use athena_ha::config::{DatabaseConfig, PoolDefaults};

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("ATHENA_HA_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if integration tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!("Skipping integration test (set ATHENA_HA_RUN_INTEGRATION_TESTS=1 to run)");
            return;
        }
    };
}

/// MySQL server the tests talk to
#[derive(Debug, Clone)]
pub struct MysqlTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl MysqlTestConfig {
    /// Pool settings for this server with small limits
    pub fn database_config(&self) -> DatabaseConfig {
        let defaults = PoolDefaults {
            max_open_conns: 4,
            max_idle_conns: 2,
            ..PoolDefaults::default()
        };
        let mut config = DatabaseConfig::new(self.host.clone(), self.port, self.user.clone(), &defaults);
        config.password = self.password.clone();
        config.database = Some(self.database.clone());
        config
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Get MySQL connection config from environment
pub fn get_mysql_config() -> MysqlTestConfig {
    MysqlTestConfig {
        host: env::var("ATHENA_HA_TEST_MYSQL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("ATHENA_HA_TEST_MYSQL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3306),
        user: env::var("ATHENA_HA_TEST_MYSQL_USER").unwrap_or_else(|_| "root".to_string()),
        password: env::var("ATHENA_HA_TEST_MYSQL_PASS").unwrap_or_default(),
        database: env::var("ATHENA_HA_TEST_MYSQL_DB").unwrap_or_else(|_| "test".to_string()),
    }
}
