//! Primary/replica clusters and their aggregated health

mod registry;
mod state;

pub use registry::{ClusterError, ClusterRegistry};
pub use state::{ClusterHealth, DatabaseCluster, FailoverConfig};
