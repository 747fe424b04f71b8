//! MySQL driver over the native wire protocol

mod connection;
mod pool;
mod transaction;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::DatabaseConfig;

use super::{DbHandle, Driver, DriverError};

pub use connection::MySqlConnection;
pub use pool::MySqlPool;
pub use transaction::MySqlTransaction;

/// Driver producing [`MySqlPool`] handles
///
/// Pools connect lazily; the first `ping` opens the first connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDriver;

#[async_trait]
impl Driver for MySqlDriver {
    async fn open(&self, config: &DatabaseConfig) -> Result<Arc<dyn DbHandle>, DriverError> {
        debug!(
            addr = %config.addr(),
            max_open = config.max_open_conns,
            max_idle = config.max_idle_conns,
            "Opening MySQL pool"
        );
        Ok(Arc::new(MySqlPool::new(config.clone())))
    }
}
