use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HaConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Health check configuration
    #[serde(default)]
    pub health: HealthCheckConfig,
    /// Failover scanning and execution
    #[serde(default)]
    pub failover: FailoverManagerConfig,
    /// Connection and query limits for the service API
    #[serde(default)]
    pub service: ServiceConfig,
    /// Pool sizing applied to pools created from `[[instances]]`
    #[serde(default)]
    pub pool_defaults: PoolDefaults,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

// ============================================================================
// Server Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address for the Prometheus endpoint; empty disables it
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9105".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metrics_addr: default_metrics_addr(),
        }
    }
}

// ============================================================================
// Health Check Configuration
// ============================================================================

/// Health check configuration for registered instances and pools
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    /// Whether the daemon starts health checking
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    /// Interval between check rounds (milliseconds)
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Timeout for each instance probe (milliseconds)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Timeout for the pool connectivity test (milliseconds)
    #[serde(default = "default_pool_probe_timeout_ms")]
    pub pool_probe_timeout_ms: u64,
}

fn default_health_enabled() -> bool {
    true
}

fn default_check_interval_ms() -> u64 {
    5000
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_pool_probe_timeout_ms() -> u64 {
    2000
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            check_interval_ms: default_check_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            pool_probe_timeout_ms: default_pool_probe_timeout_ms(),
        }
    }
}

impl HealthCheckConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn pool_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_probe_timeout_ms)
    }
}

// ============================================================================
// Failover Configuration
// ============================================================================

/// Process-wide failover settings
///
/// Per-cluster enablement and thresholds live in `ClusterConfig`.
#[derive(Debug, Clone, Deserialize)]
pub struct FailoverManagerConfig {
    /// Global gate for automatic failover from the scan task
    #[serde(default)]
    pub auto_failover: bool,
    /// Interval between failover condition scans (milliseconds)
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// How long finished operations stay observable (milliseconds)
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    /// Upper bound for the replication catch-up step (milliseconds)
    #[serde(default = "default_replication_timeout_ms")]
    pub replication_timeout_ms: u64,
    /// Poll interval while waiting for replication (milliseconds)
    #[serde(default = "default_replication_poll_interval_ms")]
    pub replication_poll_interval_ms: u64,
    /// Lag below which a candidate counts as caught up (milliseconds)
    #[serde(default = "default_acceptable_lag_ms")]
    pub acceptable_lag_ms: u64,
    /// Timeout for backend commands issued by steps (milliseconds)
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
}

fn default_scan_interval_ms() -> u64 {
    30_000
}

fn default_retention_ms() -> u64 {
    3_600_000
}

fn default_replication_timeout_ms() -> u64 {
    30_000
}

fn default_replication_poll_interval_ms() -> u64 {
    500
}

fn default_acceptable_lag_ms() -> u64 {
    1000
}

fn default_step_timeout_ms() -> u64 {
    5000
}

impl Default for FailoverManagerConfig {
    fn default() -> Self {
        Self {
            auto_failover: false,
            scan_interval_ms: default_scan_interval_ms(),
            retention_ms: default_retention_ms(),
            replication_timeout_ms: default_replication_timeout_ms(),
            replication_poll_interval_ms: default_replication_poll_interval_ms(),
            acceptable_lag_ms: default_acceptable_lag_ms(),
            step_timeout_ms: default_step_timeout_ms(),
        }
    }
}

impl FailoverManagerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    pub fn replication_poll_interval(&self) -> Duration {
        Duration::from_millis(self.replication_poll_interval_ms)
    }

    pub fn acceptable_lag(&self) -> Duration {
        Duration::from_millis(self.acceptable_lag_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

// ============================================================================
// Service Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Ping bound when handing out a connection (milliseconds)
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Bound for `execute_query` (milliseconds)
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Queries slower than this are counted as slow (milliseconds)
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: u64,
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_slow_query_threshold_ms() -> u64 {
    1000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            slow_query_threshold_ms: default_slow_query_threshold_ms(),
        }
    }
}

impl ServiceConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }
}

// ============================================================================
// Pool Configuration
// ============================================================================

/// Pool sizing and timeouts shared by pools built from topology config
#[derive(Debug, Clone, Deserialize)]
pub struct PoolDefaults {
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: usize,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    #[serde(default = "default_conn_max_lifetime_ms")]
    pub conn_max_lifetime_ms: u64,
    #[serde(default = "default_conn_max_idle_time_ms")]
    pub conn_max_idle_time_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub write_timeout_ms: u64,
}

fn default_max_open_conns() -> usize {
    25
}

fn default_max_idle_conns() -> usize {
    5
}

fn default_conn_max_lifetime_ms() -> u64 {
    1_800_000 // 30 minutes
}

fn default_conn_max_idle_time_ms() -> u64 {
    600_000 // 10 minutes
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_io_timeout_ms() -> u64 {
    30_000
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            max_open_conns: default_max_open_conns(),
            max_idle_conns: default_max_idle_conns(),
            conn_max_lifetime_ms: default_conn_max_lifetime_ms(),
            conn_max_idle_time_ms: default_conn_max_idle_time_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_io_timeout_ms(),
            write_timeout_ms: default_io_timeout_ms(),
        }
    }
}

/// Connection settings for a single pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: usize,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    #[serde(default = "default_conn_max_lifetime_ms")]
    pub conn_max_lifetime_ms: u64,
    #[serde(default = "default_conn_max_idle_time_ms")]
    pub conn_max_idle_time_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Build a config for `host:port` using the given pool defaults
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, defaults: &PoolDefaults) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: String::new(),
            database: None,
            max_open_conns: defaults.max_open_conns,
            max_idle_conns: defaults.max_idle_conns,
            conn_max_lifetime_ms: defaults.conn_max_lifetime_ms,
            conn_max_idle_time_ms: defaults.conn_max_idle_time_ms,
            connect_timeout_ms: defaults.connect_timeout_ms,
            read_timeout_ms: defaults.read_timeout_ms,
            write_timeout_ms: defaults.write_timeout_ms,
        }
    }

    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn conn_max_lifetime(&self) -> Duration {
        Duration::from_millis(self.conn_max_lifetime_ms)
    }

    pub fn conn_max_idle_time(&self) -> Duration {
        Duration::from_millis(self.conn_max_idle_time_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Reject configs that cannot produce a working pool
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid("port", "must be non-zero"));
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::invalid("user", "must not be empty"));
        }
        if self.max_open_conns == 0 {
            return Err(ConfigError::invalid("max_open_conns", "must be positive"));
        }
        if self.max_idle_conns > self.max_open_conns {
            return Err(ConfigError::invalid(
                "max_idle_conns",
                "cannot exceed max_open_conns",
            ));
        }
        if self.conn_max_lifetime_ms == 0 {
            return Err(ConfigError::invalid("conn_max_lifetime_ms", "must be positive"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::invalid("connect_timeout_ms", "must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Topology Configuration
// ============================================================================

/// Role of an instance within its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    Primary,
    #[default]
    Replica,
}

impl std::fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceRole::Primary => f.write_str("primary"),
            InstanceRole::Replica => f.write_str("replica"),
        }
    }
}

/// A MySQL server the daemon registers and pools at startup
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Stable identifier referenced by `[[clusters]]`
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub role: InstanceRole,
}

impl InstanceConfig {
    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Pool settings for this instance
    pub fn to_database_config(&self, defaults: &PoolDefaults) -> DatabaseConfig {
        let mut config = DatabaseConfig::new(self.host.clone(), self.port, self.user.clone(), defaults);
        config.password = self.password.clone();
        config.database = self.database.clone();
        config
    }
}

/// A primary/replica set
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Instance id of the primary
    pub primary: String,
    /// Instance ids of the replicas, in preference order
    #[serde(default)]
    pub replicas: Vec<String>,
    #[serde(default = "default_failover_enabled")]
    pub failover_enabled: bool,
    /// Consecutive primary probe failures before automatic failover
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_failover_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}
