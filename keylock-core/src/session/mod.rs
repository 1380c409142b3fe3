//! Per-connection session state.
//!
//! This module provides:
//! - `SessionState`: the lock-protocol phase of a connection
//! - `PendingLock`: the key and request a connection holds or awaits
//! - `Wakeup`: the message a notifier sends to a suspended connection
//! - `ConnectionRegistry`: all open connections and their sessions
//! - `ConnectionId`: unique identifier for connections

pub mod id;
pub mod registry;

pub use id::{ConnectionId, ConnectionIdGenerator};
pub use registry::ConnectionRegistry;

use std::fmt;

use crate::lock::LockRequest;
use crate::protocol::Reply;

/// Lock-protocol phase of a connection, orthogonal to its I/O state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Init,
    /// Waiting for a busy key; `lock` commands are refused.
    Blocked,
    /// Holding one key.
    Locked,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "init",
            SessionState::Blocked => "blocked",
            SessionState::Locked => "locked",
        };
        f.write_str(name)
    }
}

/// Key and request recorded by the last `lock` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLock {
    pub key: Vec<u8>,
    pub request: LockRequest,
}

/// Deferred reply delivered to a connection that was suspended on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wakeup {
    pub reply: Reply,
}
