// ABOUTME: Per-connection command pipeline: FIFO request/response pairing over a transport
// ABOUTME: Cascades transport failures and graceful drain onto every queued sink, in order

use crate::connection::Connection;
use crate::error::{Error, Metrics, Result};
use crate::resp::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// One outbound request: the value to send, and the sink its eventual
/// response (or failure) resolves to.
struct Command {
    value: Value,
    sink: oneshot::Sender<Result<Value>>,
}

/// The three states a pipeline moves through. Transitions out of
/// `Draining` or `Errored` never happen; both are one-way.
enum State {
    Default,
    Draining(Option<oneshot::Sender<()>>),
    Errored(Error),
}

/// A cheaply-cloneable handle to a running command pipeline.
///
/// Every clone shares the same outbound queue and the same underlying
/// connection; dropping all handles does not stop the actor (the pool
/// holds the canonical handle for the lifetime of the connection).
#[derive(Clone)]
pub struct PipelineHandle {
    commands: mpsc::UnboundedSender<Command>,
    drain: mpsc::UnboundedSender<oneshot::Sender<()>>,
    closed: watch::Receiver<bool>,
}

impl PipelineHandle {
    /// Send `value` and await the paired response.
    ///
    /// Fails with [`Error::ConnectionClosed`] without a round trip if the
    /// pipeline has already drained or errored.
    pub async fn call(&self, value: Value) -> Result<Value> {
        let (sink, rx) = oneshot::channel();
        self.commands
            .send(Command { value, sink })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Request a graceful drain: requests already queued complete, new
    /// writes fail immediately, and the transport closes once the queue
    /// empties. Resolves once that close has happened (or immediately, if
    /// the pipeline was already draining or errored).
    pub async fn drain(&self) {
        let (tx, rx) = oneshot::channel();
        if self.drain.send(tx).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Whether the underlying connection is still usable. `false` once the
    /// pipeline has gone terminal via error, remote close, or drain.
    pub fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Resolves once the connection has gone terminal. Resolves
    /// immediately if it already has.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        if *closed.borrow() {
            return;
        }
        let _ = closed.changed().await;
    }
}

/// Spawns the actor task that owns `conn` and drives its FIFO, and returns
/// a handle to it plus a join handle that resolves once the connection has
/// gone terminal (errored, closed, or fully drained).
pub fn spawn(conn: Connection, metrics: Arc<dyn Metrics>) -> (PipelineHandle, tokio::task::JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (drain_tx, drain_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);

    let actor = Actor {
        conn,
        state: State::Default,
        fifo: VecDeque::new(),
        metrics,
        closed: closed_tx,
    };
    let join = tokio::spawn(actor.run(command_rx, drain_rx));

    (
        PipelineHandle {
            commands: command_tx,
            drain: drain_tx,
            closed: closed_rx,
        },
        join,
    )
}

struct Actor {
    conn: Connection,
    state: State,
    fifo: VecDeque<oneshot::Sender<Result<Value>>>,
    metrics: Arc<dyn Metrics>,
    closed: watch::Sender<bool>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut drain_requests: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    ) {
        loop {
            if matches!(self.state, State::Errored(_)) {
                break;
            }

            tokio::select! {
                incoming = self.conn.read_value() => {
                    self.handle_inbound(incoming).await;
                }
                maybe_command = commands.recv() => {
                    match maybe_command {
                        Some(command) => self.handle_write(command).await,
                        None => break,
                    }
                }
                maybe_drain = drain_requests.recv() => {
                    match maybe_drain {
                        Some(completion) => self.handle_drain_event(completion).await,
                        None => break,
                    }
                }
            }
        }
        let _ = self.closed.send(true);
        // Dropping the receivers here fails any command still buffered in
        // the channel (its oneshot sender drops, so `call` observes
        // `ConnectionClosed`), and resolves any buffered drain request the
        // same way.
    }

    async fn handle_inbound(&mut self, incoming: Result<Option<Value>>) {
        match incoming {
            Ok(Some(value)) => {
                let Some(sink) = self.fifo.pop_front() else {
                    // Spec §4.2: a value with an empty FIFO is tolerated,
                    // not a protocol violation.
                    debug!("inbound value with an empty FIFO, ignoring");
                    return;
                };
                if let Value::Error(message) = value {
                    self.metrics.incr_command_failure();
                    let _ = sink.send(Err(Error::Server(message)));
                } else {
                    self.metrics.incr_command_success();
                    let _ = sink.send(Ok(value));
                }
                self.maybe_finish_draining().await;
            }
            Ok(None) => self.fail_all(Error::ConnectionClosed).await,
            Err(e) => self.fail_all(e).await,
        }
    }

    async fn handle_write(&mut self, command: Command) {
        match &self.state {
            State::Default => {
                self.fifo.push_back(command.sink);
                if let Err(e) = self.conn.write_value(&command.value).await {
                    self.fail_all(e).await;
                }
            }
            State::Draining(_) => {
                let _ = command.sink.send(Err(Error::ConnectionClosed));
            }
            State::Errored(e) => {
                let _ = command.sink.send(Err(e.clone()));
            }
        }
    }

    async fn handle_drain_event(&mut self, completion: oneshot::Sender<()>) {
        match &mut self.state {
            State::Default if self.fifo.is_empty() => {
                self.conn.close().await;
                self.state = State::Errored(Error::ConnectionClosed);
                let _ = completion.send(());
            }
            State::Default => {
                self.state = State::Draining(Some(completion));
            }
            State::Draining(_) | State::Errored(_) => {
                // Idempotent: already draining or already terminal.
                let _ = completion.send(());
            }
        }
    }

    async fn maybe_finish_draining(&mut self) {
        let is_draining_and_empty =
            matches!(self.state, State::Draining(_)) && self.fifo.is_empty();
        if !is_draining_and_empty {
            return;
        }
        let completion = match std::mem::replace(&mut self.state, State::Errored(Error::ConnectionClosed)) {
            State::Draining(completion) => completion,
            _ => unreachable!(),
        };
        self.conn.close().await;
        if let Some(completion) = completion {
            let _ = completion.send(());
        }
    }

    /// Broadcast `e` to every queued sink, in FIFO order, and go terminal.
    ///
    /// If a graceful drain was already in flight, its completion is
    /// resolved too: the transport closed, just via a different path than
    /// the queue draining naturally.
    async fn fail_all(&mut self, e: Error) {
        if matches!(self.state, State::Errored(_)) {
            return;
        }
        warn!(error = %e, "command pipeline failing all queued requests");

        let draining_completion = match &mut self.state {
            State::Draining(completion) => completion.take(),
            _ => None,
        };
        self.state = State::Errored(e.clone());

        while let Some(sink) = self.fifo.pop_front() {
            self.metrics.incr_command_failure();
            let _ = sink.send(Err(e.clone()));
        }
        self.conn.close().await;
        if let Some(completion) = draining_completion {
            let _ = completion.send(());
        }
    }
}
