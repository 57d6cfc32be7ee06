// ABOUTME: Event-loop-affine connection pool actor: lease/return, backoff creation, shutdown
// ABOUTME: All pool state lives in this task; the public Pool handle only ever sends messages

use crate::connection::Connection;
use crate::error::{Error, Metrics, Result};
use crate::pipeline::{self, PipelineHandle};
use crate::pool::config::PoolConfig;
use crate::pool::guard::PooledConnection;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A factory that produces a new, connected [`Connection`] on demand.
pub type ConnectionFactory =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Connection>> + Send>> + Send + Sync>;

pub(crate) enum PoolMessage {
    Activate,
    Lease {
        deadline: Instant,
        reply: oneshot::Sender<Result<PooledConnection>>,
    },
    Return {
        id: u64,
    },
    WaiterTimeout {
        id: u64,
    },
    ConnectionCreated {
        backoff: Duration,
        result: ConnectionCreationOutcome,
    },
    PoolConnectionClosed {
        id: u64,
    },
    ShutdownClosureDone,
    Close {
        reply: Option<oneshot::Sender<()>>,
    },
}

impl std::fmt::Debug for PoolMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolMessage::Activate => write!(f, "Activate"),
            PoolMessage::Lease { deadline, .. } => write!(f, "Lease {{ deadline: {deadline:?}, .. }}"),
            PoolMessage::Return { id } => write!(f, "Return {{ id: {id} }}"),
            PoolMessage::WaiterTimeout { id } => write!(f, "WaiterTimeout {{ id: {id} }}"),
            PoolMessage::ConnectionCreated { backoff, result } => {
                write!(f, "ConnectionCreated {{ backoff: {backoff:?}, result: {result:?} }}")
            }
            PoolMessage::PoolConnectionClosed { id } => write!(f, "PoolConnectionClosed {{ id: {id} }}"),
            PoolMessage::ShutdownClosureDone => write!(f, "ShutdownClosureDone"),
            PoolMessage::Close { .. } => write!(f, "Close {{ .. }}"),
        }
    }
}

/// `Result<Connection>` isn't `Debug` (io::Error's Arc wrapper is, but this
/// keeps the derive on [`PoolMessage`] simple without leaking `Connection`
/// details it doesn't need).
pub(crate) enum ConnectionCreationOutcome {
    Connected(Connection),
    Failed(Error),
}

impl std::fmt::Debug for ConnectionCreationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionCreationOutcome::Connected(_) => write!(f, "Connected(..)"),
            ConnectionCreationOutcome::Failed(e) => write!(f, "Failed({e})"),
        }
    }
}

struct LiveConnection {
    id: u64,
    handle: PipelineHandle,
}

struct Waiter {
    id: u64,
    sink: oneshot::Sender<Result<PooledConnection>>,
    deadline_task: tokio::task::JoinHandle<()>,
}

impl Waiter {
    fn cancel_deadline(&self) {
        self.deadline_task.abort();
    }
}

enum PoolState {
    Active,
    Closing {
        remaining: usize,
        completions: Vec<oneshot::Sender<()>>,
    },
    Closed,
}

pub(crate) struct Actor {
    config: PoolConfig,
    factory: ConnectionFactory,
    metrics: Arc<dyn Metrics>,
    state: PoolState,
    available: VecDeque<LiveConnection>,
    leased: std::collections::HashMap<u64, LiveConnection>,
    waiters: VecDeque<Waiter>,
    pending: usize,
    next_id: u64,
    self_tx: mpsc::UnboundedSender<PoolMessage>,
    return_tx: mpsc::UnboundedSender<PoolMessage>,
}

impl Actor {
    pub(crate) fn spawn(
        config: PoolConfig,
        factory: ConnectionFactory,
        metrics: Arc<dyn Metrics>,
    ) -> mpsc::UnboundedSender<PoolMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            config,
            factory,
            metrics,
            state: PoolState::Active,
            available: VecDeque::new(),
            leased: std::collections::HashMap::new(),
            waiters: VecDeque::new(),
            pending: 0,
            next_id: 0,
            self_tx: tx.clone(),
            return_tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));
        tx
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<PoolMessage>) {
        while let Some(message) = inbox.recv().await {
            self.handle(message);
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn active_count(&self) -> usize {
        self.available.len() + self.leased.len()
    }

    fn handle(&mut self, message: PoolMessage) {
        match message {
            PoolMessage::Activate => self.handle_activate(),
            PoolMessage::Lease { deadline, reply } => self.handle_lease(deadline, reply),
            PoolMessage::Return { id } => self.handle_return(id),
            PoolMessage::WaiterTimeout { id } => self.handle_waiter_timeout(id),
            PoolMessage::ConnectionCreated { backoff, result } => {
                self.handle_connection_created(backoff, result)
            }
            PoolMessage::PoolConnectionClosed { id } => self.handle_pool_connection_closed(id),
            PoolMessage::ShutdownClosureDone => self.handle_shutdown_closure_done(),
            PoolMessage::Close { reply } => self.handle_close(reply),
        }
    }

    fn handle_activate(&mut self) {
        if !matches!(self.state, PoolState::Active) {
            return;
        }
        info!("pool activated");
        while self.active_count() + self.pending < self.config.min {
            self.spawn_create_connection(self.config.initial_backoff, Duration::ZERO);
        }
    }

    fn handle_lease(&mut self, deadline: Instant, reply: oneshot::Sender<Result<PooledConnection>>) {
        if !matches!(self.state, PoolState::Active) {
            let _ = reply.send(Err(Error::PoolClosed));
            return;
        }

        while let Some(live) = self.available.pop_back() {
            if live.handle.is_connected() {
                let pooled = PooledConnection::new(live.id, live.handle.clone(), self.return_tx.clone());
                debug!(id = live.id, "leased connection from available pool");
                self.leased.insert(live.id, live);
                let _ = reply.send(Ok(pooled));
                return;
            }
            debug!(id = live.id, "dropping dead connection found in available pool");
        }

        let id = self.next_id();
        let self_tx = self.self_tx.clone();
        let deadline_task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = self_tx.send(PoolMessage::WaiterTimeout { id });
        });
        self.waiters.push_back(Waiter {
            id,
            sink: reply,
            deadline_task,
        });
        self.maybe_create_for_demand();
    }

    fn maybe_create_for_demand(&mut self) {
        if self.config.leaky || self.active_count() + self.pending < self.config.max {
            self.spawn_create_connection(self.config.initial_backoff, Duration::ZERO);
        }
    }

    fn handle_waiter_timeout(&mut self, id: u64) {
        if let Some(pos) = self.waiters.iter().position(|w| w.id == id) {
            let waiter = self.waiters.remove(pos).unwrap();
            warn!(id, "lease request timed out waiting for a connection");
            let _ = waiter.sink.send(Err(Error::TimedOutWaitingForConnection));
        }
    }

    fn handle_return(&mut self, id: u64) {
        let Some(live) = self.leased.remove(&id) else {
            return;
        };
        match &self.state {
            PoolState::Active => self.settle_returned_connection(live),
            PoolState::Closing { .. } => self.close_for_shutdown(live),
            PoolState::Closed => unreachable!("programming error: connection returned after pool closed"),
        }
    }

    /// Applies the priority-ordered placement rule to a connection that is
    /// either genuinely returned, or has just finished being created while
    /// the pool is `Active`.
    fn settle_returned_connection(&mut self, live: LiveConnection) {
        if !live.handle.is_connected() {
            debug!(id = live.id, "returned connection is dead, refilling");
            self.refill_to_minimum();
            return;
        }

        if let Some(waiter) = self.waiters.pop_front() {
            waiter.cancel_deadline();
            let pooled = PooledConnection::new(live.id, live.handle.clone(), self.return_tx.clone());
            debug!(id = live.id, "handed returned connection to a waiter");
            self.leased.insert(live.id, live);
            let _ = waiter.sink.send(Ok(pooled));
            return;
        }

        if self.can_add_to_available() {
            self.available.push_back(live);
            return;
        }

        if let Some(evicted) = self.available.pop_front() {
            debug!(evicted = evicted.id, incoming = live.id, "pool at capacity, evicting oldest");
            self.close_idle(evicted);
            self.available.push_back(live);
            return;
        }

        self.close_idle(live);
    }

    fn can_add_to_available(&self) -> bool {
        if self.config.leaky {
            self.available.len() < self.config.max
        } else {
            self.available.len() + self.leased.len() < self.config.max
        }
    }

    fn close_idle(&self, live: LiveConnection) {
        tokio::spawn(async move {
            live.handle.drain().await;
        });
    }

    fn close_for_shutdown(&self, live: LiveConnection) {
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            live.handle.drain().await;
            let _ = self_tx.send(PoolMessage::ShutdownClosureDone);
        });
    }

    fn spawn_create_connection(&mut self, backoff: Duration, start_in: Duration) {
        self.pending += 1;
        let factory = self.factory.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            if !start_in.is_zero() {
                tokio::time::sleep(start_in).await;
            }
            let result = match factory().await {
                Ok(conn) => ConnectionCreationOutcome::Connected(conn),
                Err(e) => ConnectionCreationOutcome::Failed(e),
            };
            let _ = self_tx.send(PoolMessage::ConnectionCreated { backoff, result });
        });
    }

    fn handle_connection_created(&mut self, backoff: Duration, result: ConnectionCreationOutcome) {
        self.pending -= 1;
        match result {
            ConnectionCreationOutcome::Connected(conn) => self.handle_connection_success(conn),
            ConnectionCreationOutcome::Failed(e) => self.handle_connection_failure(backoff, e),
        }
    }

    fn handle_connection_success(&mut self, conn: Connection) {
        match &self.state {
            PoolState::Active => {
                let id = self.next_id();
                let (handle, _join) = pipeline::spawn(conn, self.metrics.clone());
                self.spawn_close_observer(id, handle.clone());
                info!(id, "connection established");
                self.settle_returned_connection(LiveConnection { id, handle });
            }
            PoolState::Closing { .. } => {
                let id = self.next_id();
                let (handle, _join) = pipeline::spawn(conn, self.metrics.clone());
                self.close_for_shutdown(LiveConnection { id, handle });
            }
            PoolState::Closed => unreachable!("programming error: connection created after pool closed"),
        }
    }

    /// Installed before the connection is placed in `available` or handed
    /// to a waiter, so no close event is missed between creation and first
    /// use.
    fn spawn_close_observer(&self, id: u64, handle: PipelineHandle) {
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            handle.closed().await;
            let _ = self_tx.send(PoolMessage::PoolConnectionClosed { id });
        });
    }

    fn handle_pool_connection_closed(&mut self, id: u64) {
        if let Some(pos) = self.available.iter().position(|c| c.id == id) {
            self.available.remove(pos);
            debug!(id, "idle connection closed, refilling");
            self.refill_to_minimum();
        }
    }

    fn refill_to_minimum(&mut self) {
        if matches!(self.state, PoolState::Active) && self.active_count() + self.pending < self.config.min {
            self.spawn_create_connection(self.config.initial_backoff, Duration::ZERO);
        }
    }

    fn handle_connection_failure(&mut self, backoff: Duration, e: Error) {
        match &mut self.state {
            PoolState::Closing { .. } => self.handle_shutdown_closure_done(),
            PoolState::Closed => unreachable!("programming error: connection attempt resolved after pool closed"),
            PoolState::Active => {
                warn!(error = %e, "connection attempt failed");
                let retry = if self.config.leaky {
                    self.waiters.len() > self.pending || self.active_count() < self.config.min
                } else {
                    (!self.waiters.is_empty() && self.active_count() < self.config.max)
                        || self.active_count() < self.config.min
                };
                if retry {
                    let new_backoff = backoff.mul_f64(self.config.backoff_factor);
                    debug!(delay_ms = backoff.as_millis() as u64, "retrying connection creation after backoff");
                    self.spawn_create_connection(new_backoff, backoff);
                }
            }
        }
    }

    fn handle_shutdown_closure_done(&mut self) {
        if let PoolState::Closing { remaining, completions } = &mut self.state {
            *remaining -= 1;
            if *remaining == 0 {
                let completions = std::mem::take(completions);
                self.state = PoolState::Closed;
                info!("pool closed");
                for completion in completions {
                    let _ = completion.send(());
                }
            }
        }
    }

    fn handle_close(&mut self, reply: Option<oneshot::Sender<()>>) {
        match &mut self.state {
            PoolState::Active => {
                while let Some(waiter) = self.waiters.pop_front() {
                    waiter.cancel_deadline();
                    let _ = waiter.sink.send(Err(Error::PoolClosed));
                }

                let remaining = self.available.len() + self.leased.len() + self.pending;
                let mut completions = Vec::new();
                if let Some(reply) = reply {
                    completions.push(reply);
                }

                if remaining == 0 {
                    self.state = PoolState::Closed;
                    info!("pool closed");
                    for completion in completions {
                        let _ = completion.send(());
                    }
                    return;
                }

                self.state = PoolState::Closing { remaining, completions };
                let available: Vec<_> = self.available.drain(..).collect();
                for live in available {
                    self.close_for_shutdown(live);
                }
            }
            PoolState::Closing { completions, .. } => {
                if let Some(reply) = reply {
                    completions.push(reply);
                }
            }
            PoolState::Closed => {
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }
}
