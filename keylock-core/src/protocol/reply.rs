//! Reply lines written back to clients.

use std::fmt;

use crate::error::ProtocolError;
use crate::lock::LockMode;
use crate::metrics::MetricsSnapshot;
use crate::protocol::PROTOCOL_VERSION;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    LockSuccess,
    LockFailed,
    BadFormat,
    BadFlags,
    IllegalFlags,
    WaitingForLock,
    AlreadyLocked,
    UnlockSuccess,
    SequenceError,
    KeyNotFound,
    KeyFound {
        mode: LockMode,
        refcount: u32,
        created_at: u64,
    },
    Stats(MetricsSnapshot),
    Help,
    Unimplemented,
    OutOfMemory,
    LineTooLong,
}

impl Reply {
    pub fn is_error(&self) -> bool {
        self.to_string().starts_with("-ERR")
    }
}

impl From<ProtocolError> for Reply {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::KeyTooLong => Reply::BadFormat,
            ProtocolError::FlagsTooLong => Reply::BadFlags,
            ProtocolError::IllegalFlag(_) => Reply::IllegalFlags,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::LockSuccess => f.write_str("+OK, lock success"),
            Reply::LockFailed => f.write_str("-ERR, lock failed"),
            Reply::BadFormat => f.write_str("-ERR, bad command line format"),
            Reply::BadFlags => f.write_str("-ERR, bad command flags parameter"),
            Reply::IllegalFlags => f.write_str("-ERR, illegal flags parameter"),
            Reply::WaitingForLock => f.write_str("-ERR, waiting for have lock"),
            Reply::AlreadyLocked => f.write_str("-ERR, have locked one key"),
            Reply::UnlockSuccess => f.write_str("+OK, unlock success"),
            Reply::SequenceError => f.write_str("-ERR, sequence error"),
            Reply::KeyNotFound => f.write_str("+OK, the key is not exist"),
            Reply::KeyFound {
                mode,
                refcount,
                created_at,
            } => write!(f, "+OK, the key {mode} locked ref {refcount} at {created_at}"),
            Reply::Stats(stats) => write!(
                f,
                "+OK, server stats:\r\n\
                 server started: {}\r\n\
                 current conns: {}\r\n\
                 total conns: {}\r\n\
                 locked cmds: {}\r\n\
                 locked hits: {}\r\n\
                 locked blks: {}\r\n\
                 unlock cmds: {}",
                stats.started_at,
                stats.current_connections,
                stats.total_connections,
                stats.lock_granted,
                stats.lock_denied,
                stats.lock_blocked,
                stats.unlock_commands,
            ),
            Reply::Help => write!(
                f,
                "+OK, lock server command usage (V{PROTOCOL_VERSION}):\r\n\
                 lock key_string {{n | w/r}}\r\n\
                 unlock\r\n\
                 quit\r\n\
                 find key_string\r\n\
                 stats\r\n\
                 help"
            ),
            Reply::Unimplemented => f.write_str("-ERR, unimplemented"),
            Reply::OutOfMemory => f.write_str("-ERR, out of memory reading request"),
            Reply::LineTooLong => f.write_str("-ERR, server output line too long"),
        }
    }
}
