//! Lock table and the request/outcome vocabulary shared with the protocol layer.
//!
//! The table has no knowledge of connections: it only decides admission for a
//! key and tracks how many holders the key currently has.

pub mod table;

pub use table::{LockEntry, LockTable};

use std::borrow::Cow;
use std::fmt;

/// Render a key for log output. Keys are arbitrary bytes.
pub fn display_key(key: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(key)
}

/// Access mode of a lock. Fixed for the lifetime of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockMode {
    /// Shared.
    #[default]
    Read,
    /// Exclusive.
    Write,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the caller is prepared to wait for a busy key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WaitPolicy {
    #[default]
    Block,
    NonBlock,
}

/// A lock request as carried by the `lock` command flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LockRequest {
    pub mode: LockMode,
    pub wait: WaitPolicy,
}

impl LockRequest {
    pub fn new(mode: LockMode, wait: WaitPolicy) -> Self {
        Self { mode, wait }
    }

    pub fn read() -> Self {
        Self::new(LockMode::Read, WaitPolicy::Block)
    }

    pub fn write() -> Self {
        Self::new(LockMode::Write, WaitPolicy::Block)
    }

    pub fn nonblocking(self) -> Self {
        Self {
            wait: WaitPolicy::NonBlock,
            ..self
        }
    }
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    Denied,
    MustWait,
}
