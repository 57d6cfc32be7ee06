// ABOUTME: Connection pool public surface: construction, lease, activate, close
// ABOUTME: State mutation itself lives in the `actor` submodule's dedicated task

mod actor;
mod config;
pub mod guard;

use crate::connection::Connection;
use crate::error::{Error, Metrics, NoopMetrics, Result};
use actor::{Actor, ConnectionFactory, PoolMessage};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

pub use config::PoolConfig;
pub use guard::PooledConnection;

/// A handle to a running, event-loop-affine connection pool.
///
/// Cloning a `Pool` is cheap — every clone is a thin wrapper around the
/// same message channel into the pool's dedicated actor task, so the
/// actual state lives in exactly one place regardless of how many callers
/// hold a handle.
#[derive(Clone)]
pub struct Pool {
    commands: mpsc::UnboundedSender<PoolMessage>,
}

impl Pool {
    /// Build a pool with no metrics hooks.
    pub fn new<F, Fut>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Connection>> + Send + 'static,
    {
        Self::with_metrics(config, factory, Arc::new(NoopMetrics))
    }

    /// Build a pool whose command pipelines report outcomes to `metrics`.
    pub fn with_metrics<F, Fut>(config: PoolConfig, factory: F, metrics: Arc<dyn Metrics>) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Connection>> + Send + 'static,
    {
        let factory: ConnectionFactory = Arc::new(move || {
            let fut = factory();
            Box::pin(fut) as Pin<Box<dyn Future<Output = Result<Connection>> + Send>>
        });
        let commands = Actor::spawn(config, factory, metrics);
        Pool { commands }
    }

    /// Schedule a refill pass bringing the live population up to the
    /// configured minimum. Idempotent while active; a no-op once closing
    /// or closed.
    pub fn activate(&self) {
        let _ = self.commands.send(PoolMessage::Activate);
    }

    /// Lease a connection, waiting at most until `deadline`.
    pub async fn lease(&self, deadline: Instant) -> Result<PooledConnection> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PoolMessage::Lease { deadline, reply })
            .map_err(|_| Error::PoolClosed)?;
        rx.await.map_err(|_| Error::PoolClosed)?
    }

    /// Lease a connection, waiting at most `timeout` from now.
    pub async fn lease_with_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        self.lease(Instant::now() + timeout).await
    }

    /// Close the pool: every queued waiter fails with `PoolClosed`, every
    /// available connection drains and closes, and leased connections
    /// close as they are returned. Resolves once the last one has.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(PoolMessage::Close { reply: Some(reply) }).is_err() {
            return;
        }
        let _ = rx.await;
    }
}
