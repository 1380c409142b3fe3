use thiserror::Error;

/// Errors raised by the lock table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("lock key not found: {0}")]
    NotFound(String),
}

/// Malformed `lock` command arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("key exceeds the maximum length")]
    KeyTooLong,
    #[error("flags parameter is too long")]
    FlagsTooLong,
    #[error("illegal flag character {0:?}")]
    IllegalFlag(char),
}

/// Read buffer could not make room for more input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("read buffer would exceed {limit} bytes")]
    LimitExceeded { limit: usize },
    #[error("failed to grow read buffer to {requested} bytes")]
    AllocationFailed { requested: usize },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("maximum number of connections reached")]
    MaxConnectionsReached,
}
