//! Connection registry - tracks every open client connection.
//!
//! The registry:
//! - Records connections on accept and forgets them on close
//! - Owns each connection's session state and pending lock
//! - Finds a blocked connection waiting on a released key
//! - Delivers wakeup replies to suspended connections

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::config::{WakeMatch, WakeOrder};
use crate::protocol::Reply;
use crate::session::id::ConnectionId;
use crate::session::{PendingLock, SessionState, Wakeup};

/// Session half of a connection, shared with the notifier.
#[derive(Debug)]
pub struct ConnectionEntry {
    id: ConnectionId,
    peer: String,
    connected_at: Instant,
    pub session: SessionState,
    pub pending: Option<PendingLock>,
    waker: UnboundedSender<Wakeup>,
}

impl ConnectionEntry {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Key currently held, if the session is locked.
    pub fn held_key(&self) -> Option<&[u8]> {
        match (self.session, &self.pending) {
            (SessionState::Locked, Some(pending)) => Some(pending.key.as_slice()),
            _ => None,
        }
    }

    /// Queue a deferred reply for the connection task. Returns false when the
    /// task has already gone away.
    pub fn wake(&self, reply: Reply) -> bool {
        self.waker.send(Wakeup { reply }).is_ok()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RegistrySnapshot {
    pub total_connections: usize,
    pub blocked_connections: usize,
    pub locked_connections: usize,
    pub wake_order: WakeOrder,
    pub wake_match: WakeMatch,
    pub oldest_connection_ms: u64,
}

/// Open connections kept in registration order.
#[derive(Debug)]
pub struct ConnectionRegistry {
    entries: Vec<ConnectionEntry>,
    wake_order: WakeOrder,
    wake_match: WakeMatch,
}

impl ConnectionRegistry {
    pub fn new(wake_order: WakeOrder, wake_match: WakeMatch) -> Self {
        Self {
            entries: Vec::new(),
            wake_order,
            wake_match,
        }
    }

    pub fn register(&mut self, id: ConnectionId, peer: String, waker: UnboundedSender<Wakeup>) {
        debug!(conn_id = %id, %peer, total = self.entries.len() + 1, "registered connection");
        self.entries.push(ConnectionEntry {
            id,
            peer,
            connected_at: Instant::now(),
            session: SessionState::Init,
            pending: None,
            waker,
        });
    }

    pub fn deregister(&mut self, id: ConnectionId) -> Option<ConnectionEntry> {
        let Some(index) = self.entries.iter().position(|entry| entry.id == id) else {
            warn!(conn_id = %id, "deregistering unknown connection");
            return None;
        };
        Some(self.entries.remove(index))
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionEntry> {
        self.entries.iter_mut().find(|entry| entry.id == id)
    }

    /// First blocked connection, other than `releaser`, whose pending key
    /// matches `released_key`, scanned in wake order.
    pub fn find_blocked(&self, released_key: &[u8], releaser: ConnectionId) -> Option<ConnectionId> {
        let matches = |entry: &&ConnectionEntry| {
            entry.id != releaser
                && entry.session == SessionState::Blocked
                && entry
                    .pending
                    .as_ref()
                    .is_some_and(|pending| key_matches(&pending.key, released_key, self.wake_match))
        };

        let found = match self.wake_order {
            WakeOrder::Lifo => self.entries.iter().rev().find(matches),
            WakeOrder::Fifo => self.entries.iter().find(matches),
        };
        found.map(|entry| entry.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let count = |state: SessionState| {
            self.entries
                .iter()
                .filter(|entry| entry.session == state)
                .count()
        };
        let oldest_connection_ms = self
            .entries
            .first()
            .map(|entry| entry.connected_for().as_millis() as u64)
            .unwrap_or(0);

        RegistrySnapshot {
            total_connections: self.entries.len(),
            blocked_connections: count(SessionState::Blocked),
            locked_connections: count(SessionState::Locked),
            wake_order: self.wake_order,
            wake_match: self.wake_match,
            oldest_connection_ms,
        }
    }
}

/// Compare a waiter's pending key with a released key.
///
/// `Prefix` compares only the first `released.len()` bytes, ignoring ASCII
/// case, so a release of `ab` can wake a waiter on `ABC`.
pub fn key_matches(pending: &[u8], released: &[u8], mode: WakeMatch) -> bool {
    match mode {
        WakeMatch::Exact => pending == released,
        WakeMatch::Prefix => pending
            .get(..released.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(released)),
    }
}
