//! Lock service: the shared core every connection task talks to.
//!
//! The lock table and the connection registry sit behind one mutex so that a
//! command, and any notification it triggers, is applied atomically with
//! respect to every other connection.

mod handlers;
pub mod notify;

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, instrument};

use crate::config::ServerConfig;
use crate::lock::{display_key, LockEntry, LockTable};
use crate::metrics::{ConnectionGuard, Metrics, MetricsSnapshot};
use crate::protocol::{Command, Reply};
use crate::session::registry::RegistrySnapshot;
use crate::session::{ConnectionId, ConnectionIdGenerator, ConnectionRegistry, Wakeup};

/// What the connection must do after a command line has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Queue this reply.
    Reply(Reply),
    /// The request is suspended; no reply until a wakeup arrives.
    Wait,
    /// Close the connection without replying.
    Close,
}

pub(crate) struct CoreState {
    pub(crate) table: LockTable,
    pub(crate) registry: ConnectionRegistry,
}

/// Handle returned to a freshly accepted connection.
pub struct Registration {
    pub id: ConnectionId,
    pub wakeups: UnboundedReceiver<Wakeup>,
    _guard: ConnectionGuard,
}

#[derive(Clone, Debug, Serialize)]
pub struct ServiceSnapshot {
    pub metrics: MetricsSnapshot,
    pub connections: RegistrySnapshot,
    pub locked_keys: usize,
}

pub struct LockService {
    state: Mutex<CoreState>,
    metrics: Metrics,
    ids: ConnectionIdGenerator,
}

impl LockService {
    pub fn new(config: &ServerConfig, metrics: Metrics) -> Self {
        info!(
            wake_order = ?config.wake_order,
            wake_match = ?config.wake_match,
            "lock service initialized"
        );
        Self {
            state: Mutex::new(CoreState {
                table: LockTable::new(),
                registry: ConnectionRegistry::new(config.wake_order, config.wake_match),
            }),
            metrics,
            ids: ConnectionIdGenerator::new(),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn lock_state(&self) -> MutexGuard<'_, CoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new connection in session state `init`.
    pub fn connect(&self, peer: impl Into<String>) -> Registration {
        let id = self.ids.next();
        let (tx, rx) = mpsc::unbounded_channel();
        let guard = self.metrics.connection_opened();
        self.lock_state().registry.register(id, peer.into(), tx);
        Registration {
            id,
            wakeups: rx,
            _guard: guard,
        }
    }

    /// Handle one command line on behalf of connection `id`.
    #[instrument(level = "debug", skip_all, fields(conn_id = %id))]
    pub fn execute(&self, id: ConnectionId, line: impl AsRef<[u8]>) -> Outcome {
        let line = line.as_ref();
        let command = Command::parse(line);
        debug!(command = command.name(), line = %display_key(line), "processing command");
        let mut state = self.lock_state();
        let outcome = handlers::dispatch(&mut state, &self.metrics, id, command);
        debug!(?outcome, "command handled");
        outcome
    }

    /// Forget a connection, releasing its lock and waking one waiter if it
    /// held one.
    #[instrument(level = "debug", skip_all, fields(conn_id = %id))]
    pub fn disconnect(&self, id: ConnectionId) {
        let mut state = self.lock_state();
        let Some(entry) = state.registry.deregister(id) else {
            return;
        };
        debug!(peer = entry.peer(), session = %entry.session, "connection closed");

        if let Some(key) = entry.held_key() {
            match state.table.release(key) {
                Ok(()) => {
                    notify::wake_one(&mut state, &self.metrics, key, id);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "held lock missing from table on close");
                }
            }
        }
    }

    pub fn lookup(&self, key: impl AsRef<[u8]>) -> Option<LockEntry> {
        self.lock_state().table.lookup(key.as_ref()).cloned()
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        let state = self.lock_state();
        ServiceSnapshot {
            metrics: self.metrics.snapshot(),
            connections: state.registry.snapshot(),
            locked_keys: state.table.len(),
        }
    }
}
