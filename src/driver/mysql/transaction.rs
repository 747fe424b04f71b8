use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::driver::{DbTransaction, DriverError, ExecResult};

use super::pool::{Checkout, PoolShared};

/// A transaction bound to one pooled connection
///
/// The connection is held until COMMIT or ROLLBACK. Dropping the transaction
/// without finishing it closes the connection, which makes the server roll
/// the transaction back.
pub struct MySqlTransaction {
    shared: Arc<PoolShared>,
    checkout: Checkout,
}

impl MySqlTransaction {
    pub(crate) fn new(shared: Arc<PoolShared>, checkout: Checkout) -> Self {
        Self { shared, checkout }
    }

    async fn finish(self, sql: &str) -> Result<(), DriverError> {
        let Self {
            shared,
            mut checkout,
        } = self;
        let result = checkout.conn.execute(sql).await.map(|_| ());
        debug!(statement = sql, ok = result.is_ok(), "Finished transaction");
        shared.checkin(checkout, true).await;
        result
    }
}

#[async_trait]
impl DbTransaction for MySqlTransaction {
    async fn execute(&mut self, sql: &str) -> Result<ExecResult, DriverError> {
        self.checkout.conn.execute(sql).await
    }

    async fn commit(self: Box<Self>) -> Result<(), DriverError> {
        (*self).finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), DriverError> {
        (*self).finish("ROLLBACK").await
    }
}
