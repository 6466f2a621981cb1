//! Connection draining for server listeners.
//!
//! Tracks every accepted connection as Active (handling a request), Idle
//! (open, nothing in flight) or Closed. When shutdown is initiated the
//! drainer closes the listener and every idle connection; active
//! connections are left to finish, and are closed the moment they report
//! idle.
//!
//! All transitions and the drain trigger are processed by a single task,
//! in order, so the connection map needs no locking. Waiting for the drain
//! to finish goes through the same queue, so it observes every connection
//! registered before the wait began.
//!
//! Connections hijacked by the application (websocket upgrades and the like)
//! are not tracked here. Their owners must watch the shutdown-initiated
//! signal and close them themselves.

use crate::net::id::ConnectionId;
use crate::shutdown::{Signal, SignalWatch};
use std::collections::HashMap;
use std::io;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Something the drainer can close: a listener or a single connection.
pub trait Close: Send + Sync + 'static {
    fn close(&self) -> io::Result<()>;
}

/// A per-connection close request, observed by the task serving it.
impl Close for Signal {
    fn close(&self) -> io::Result<()> {
        self.fire();
        Ok(())
    }
}

/// Lifecycle state of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A request is in flight.
    Active,
    /// Open with nothing in flight.
    Idle,
    /// Closed, or asked to close by the drainer.
    Closed,
}

/// Snapshot of the drainer's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub active: usize,
    pub idle: usize,
    /// Connections the drainer closed that have not yet reported closed.
    pub closing: usize,
    pub draining: bool,
}

enum Command {
    Register(ConnectionId, Box<dyn Close>),
    Transition(ConnectionId, ConnectionState),
    Stats(oneshot::Sender<DrainStats>),
    Drained(oneshot::Sender<()>),
}

/// Cloneable handle used by the serving layer to report connection transitions.
///
/// Reports are queued and applied by the drainer task; they never run on the
/// caller's task.
#[derive(Clone)]
pub struct DrainHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl DrainHandle {
    /// Start tracking a newly accepted connection. It begins Idle.
    pub fn register(&self, id: ConnectionId, closer: impl Close) {
        let _ = self.commands.send(Command::Register(id, Box::new(closer)));
    }

    /// Report a state transition for a tracked connection.
    pub fn transition(&self, id: ConnectionId, state: ConnectionState) {
        let _ = self.commands.send(Command::Transition(id, state));
    }

    /// Report that a request started on the connection.
    pub fn active(&self, id: ConnectionId) {
        self.transition(id, ConnectionState::Active);
    }

    /// Report that the connection has nothing in flight.
    pub fn idle(&self, id: ConnectionId) {
        self.transition(id, ConnectionState::Idle);
    }

    /// Report that the connection's transport has closed.
    pub fn closed(&self, id: ConnectionId) {
        self.transition(id, ConnectionState::Closed);
    }

    /// Fetch a snapshot, ordered after every report queued before this call.
    ///
    /// Returns `None` if the drainer has stopped.
    pub async fn stats(&self) -> Option<DrainStats> {
        let (reply, response) = oneshot::channel();
        self.commands.send(Command::Stats(reply)).ok()?;
        response.await.ok()
    }
}

/// Drains one listener's connections once shutdown is initiated.
pub struct ConnectionDrainer {
    handle: DrainHandle,
    task: JoinHandle<()>,
}

impl ConnectionDrainer {
    /// Spawn the drainer task.
    ///
    /// `listener` is closed when `initiated` fires. Must be called from
    /// within a tokio runtime.
    pub fn spawn(initiated: SignalWatch, listener: impl Close) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();

        let state = DrainState {
            listener: Box::new(listener),
            connections: HashMap::new(),
            draining: false,
            waiters: Vec::new(),
        };

        Self {
            handle: DrainHandle { commands },
            task: tokio::spawn(state.run(receiver, initiated)),
        }
    }

    /// Handle for reporting connection transitions to this drainer.
    pub fn handle(&self) -> DrainHandle {
        self.handle.clone()
    }

    /// Wait until draining has begun and every connection registered before
    /// this call has closed.
    pub async fn drained(&self) {
        let (reply, response) = oneshot::channel();
        if self.handle.commands.send(Command::Drained(reply)).is_ok() {
            let _ = response.await;
        }
    }
}

impl Drop for ConnectionDrainer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ConnectionRecord {
    state: ConnectionState,
    closer: Box<dyn Close>,
}

struct DrainState {
    listener: Box<dyn Close>,
    connections: HashMap<ConnectionId, ConnectionRecord>,
    draining: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

impl DrainState {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, initiated: SignalWatch) {
        loop {
            tokio::select! {
                biased;

                _ = initiated.wait(), if !self.draining => self.begin_drain(),

                command = commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
            }

            if self.draining && self.connections.is_empty() && !self.waiters.is_empty() {
                info!("all connections drained");
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        }
    }

    fn begin_drain(&mut self) {
        if let Err(e) = self.listener.close() {
            warn!(error = %e, "failed to close listener");
        }
        self.draining = true;

        let mut closed = 0;
        for (id, record) in self.connections.iter_mut() {
            if record.state == ConnectionState::Idle {
                close_connection(*id, record);
                closed += 1;
            }
        }

        info!(
            idle_closed = closed,
            remaining = self.connections.len(),
            "draining connections"
        );
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register(id, closer) => {
                let mut record = ConnectionRecord {
                    state: ConnectionState::Idle,
                    closer,
                };
                // Accepted just as the listener closed.
                if self.draining {
                    close_connection(id, &mut record);
                }
                self.connections.insert(id, record);
            }
            Command::Transition(id, ConnectionState::Closed) => {
                if self.connections.remove(&id).is_some() {
                    debug!(connection = %id, "connection closed");
                }
            }
            Command::Transition(id, state) => {
                let Some(record) = self.connections.get_mut(&id) else {
                    debug!(connection = %id, state = ?state, "transition for untracked connection");
                    return;
                };
                if record.state == ConnectionState::Closed {
                    return;
                }

                record.state = state;
                if state == ConnectionState::Idle && self.draining {
                    close_connection(id, record);
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Drained(reply) => self.waiters.push(reply),
        }
    }

    fn stats(&self) -> DrainStats {
        let mut stats = DrainStats {
            draining: self.draining,
            ..DrainStats::default()
        };
        for record in self.connections.values() {
            match record.state {
                ConnectionState::Active => stats.active += 1,
                ConnectionState::Idle => stats.idle += 1,
                ConnectionState::Closed => stats.closing += 1,
            }
        }
        stats
    }
}

fn close_connection(id: ConnectionId, record: &mut ConnectionRecord) {
    if let Err(e) = record.closer.close() {
        warn!(connection = %id, error = %e, "failed to close connection");
    }
    record.state = ConnectionState::Closed;
    debug!(connection = %id, "idle connection closed for drain");
}
