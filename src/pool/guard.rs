// ABOUTME: RAII lease guard returned by Pool::lease; returns its connection on drop

use crate::error::Result;
use crate::pipeline::PipelineHandle;
use crate::pool::actor::PoolMessage;
use crate::resp::Value;
use tokio::sync::mpsc;

/// A connection leased from a [`crate::pool::Pool`].
///
/// Dropping this value returns the connection to the pool (or, if the
/// connection has died or the pool is shutting down, hands it off for
/// closure) — callers never call `returnConnection` themselves.
pub struct PooledConnection {
    id: u64,
    handle: PipelineHandle,
    return_tx: mpsc::UnboundedSender<PoolMessage>,
}

impl PooledConnection {
    pub(crate) fn new(id: u64, handle: PipelineHandle, return_tx: mpsc::UnboundedSender<PoolMessage>) -> Self {
        PooledConnection { id, handle, return_tx }
    }

    /// Send `value` over this connection and await the paired response.
    pub async fn call(&self, value: Value) -> Result<Value> {
        self.handle.call(value).await
    }

    /// Whether the leased connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let _ = self.return_tx.send(PoolMessage::Return { id: self.id });
    }
}
