mod registry;
mod stats;

pub use registry::{ConnectionPool, ConnectionPoolRegistry, PoolError};
pub use stats::PoolStats;
