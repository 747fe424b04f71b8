use std::time::Duration;

use serde::Serialize;

use crate::driver::DbStats;

/// Connection pool statistics as last copied from the driver handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_open_connections: usize,
    pub open_connections: usize,
    pub in_use: usize,
    pub idle: usize,
    pub wait_count: u64,
    pub wait_duration: Duration,
    pub max_idle_closed: u64,
    pub max_idle_time_closed: u64,
    pub max_lifetime_closed: u64,
}

impl PoolStats {
    /// Percentage of the connection limit currently in use
    pub fn utilization(&self) -> f64 {
        if self.max_open_connections == 0 {
            return 0.0;
        }
        self.in_use as f64 / self.max_open_connections as f64 * 100.0
    }

    /// Callers have had to queue for a connection for a noticeable time
    pub fn has_wait_pressure(&self) -> bool {
        self.wait_count > 0 && self.wait_duration > Duration::from_secs(1)
    }
}

impl From<DbStats> for PoolStats {
    fn from(stats: DbStats) -> Self {
        Self {
            max_open_connections: stats.max_open_connections,
            open_connections: stats.open_connections,
            in_use: stats.in_use,
            idle: stats.idle,
            wait_count: stats.wait_count,
            wait_duration: stats.wait_duration,
            max_idle_closed: stats.max_idle_closed,
            max_idle_time_closed: stats.max_idle_time_closed,
            max_lifetime_closed: stats.max_lifetime_closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization() {
        let stats = PoolStats {
            max_open_connections: 20,
            in_use: 19,
            ..Default::default()
        };
        assert!((stats.utilization() - 95.0).abs() < f64::EPSILON);
        assert_eq!(PoolStats::default().utilization(), 0.0);
    }

    #[test]
    fn test_wait_pressure_needs_both_conditions() {
        let mut stats = PoolStats {
            wait_count: 3,
            wait_duration: Duration::from_millis(500),
            ..Default::default()
        };
        assert!(!stats.has_wait_pressure());
        stats.wait_duration = Duration::from_secs(2);
        assert!(stats.has_wait_pressure());
        stats.wait_count = 0;
        assert!(!stats.has_wait_pressure());
    }
}
