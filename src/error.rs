//! Service-level error type

use crate::cluster::ClusterError;
use crate::config::ConfigError;
use crate::driver::DriverError;
use crate::failover::FailoverError;
use crate::health::HealthError;
use crate::instance::InstanceError;
use crate::pool::PoolError;

/// Any failure surfaced by [`HaService`](crate::service::HaService)
#[derive(Debug, thiserror::Error)]
pub enum HaError {
    #[error("primary database unavailable")]
    PrimaryUnavailable,

    #[error("no connection pool found for primary database")]
    NoPrimaryPool,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error(transparent)]
    Failover(#[from] FailoverError),
}

impl HaError {
    /// The referenced pool, instance, cluster or operation does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HaError::Pool(PoolError::NotFound(_))
                | HaError::Instance(InstanceError::NotFound(_))
                | HaError::Cluster(ClusterError::NotFound(_))
                | HaError::Health(HealthError::Instance(InstanceError::NotFound(_)))
                | HaError::Failover(FailoverError::NotFound(_))
        )
    }
}
