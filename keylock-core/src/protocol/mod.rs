//! Line protocol: tokenizing, command recognition and reply rendering.

pub mod reply;
pub mod tokenizer;

pub use reply::Reply;
pub use tokenizer::{tokenize, Tokens};

use crate::error::ProtocolError;
use crate::lock::{LockMode, LockRequest, WaitPolicy};

/// Version reported by `help`.
pub const PROTOCOL_VERSION: &str = "0.0.1";

/// Longest key accepted on the wire.
pub const KEY_MAX_LENGTH: usize = 64;

/// Longest key stored in the table and in a connection's pending lock.
pub const KEY_STORE_LENGTH: usize = 63;

/// Longest flags token.
pub const FLAGS_MAX_LENGTH: usize = 2;

const FLAG_CHARS: &[u8] = b"rwnb";

/// A recognised command line. Keys are raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Lock { key: &'a [u8], flags: &'a [u8] },
    Unlock,
    Quit,
    Stats,
    Help,
    Find { key: &'a [u8] },
    Unknown,
}

impl<'a> Command<'a> {
    /// Recognise a command from its tokens. Dispatch depends on the token
    /// count, which includes the trailing remainder slot.
    pub fn parse(line: &'a [u8]) -> Self {
        let tokens = tokenize(line);
        match (tokens.count(), tokens.word(0)) {
            (n, Some(b"lock")) if n >= 4 => Command::Lock {
                key: tokens.word(1).unwrap_or_default(),
                flags: tokens.word(2).unwrap_or_default(),
            },
            (2, Some(b"unlock")) => Command::Unlock,
            (2, Some(b"quit")) => Command::Quit,
            (2, Some(b"stats")) => Command::Stats,
            (2, Some(b"help")) => Command::Help,
            (3, Some(b"find")) => Command::Find {
                key: tokens.word(1).unwrap_or_default(),
            },
            _ => Command::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Lock { .. } => "lock",
            Command::Unlock => "unlock",
            Command::Quit => "quit",
            Command::Stats => "stats",
            Command::Help => "help",
            Command::Find { .. } => "find",
            Command::Unknown => "unknown",
        }
    }
}

pub fn check_key(key: &[u8]) -> Result<(), ProtocolError> {
    if key.len() > KEY_MAX_LENGTH {
        return Err(ProtocolError::KeyTooLong);
    }
    Ok(())
}

/// The part of a key kept in the table: its first `KEY_STORE_LENGTH` bytes.
pub fn stored_key(key: &[u8]) -> &[u8] {
    &key[..key.len().min(KEY_STORE_LENGTH)]
}

/// Parse a flags token: `w` requests write, `n` non-blocking; `r` and `b`
/// are accepted and ignored.
pub fn parse_flags(flags: &[u8]) -> Result<LockRequest, ProtocolError> {
    if flags.len() > FLAGS_MAX_LENGTH {
        return Err(ProtocolError::FlagsTooLong);
    }
    if let Some(&bad) = flags.iter().find(|&&b| !FLAG_CHARS.contains(&b)) {
        return Err(ProtocolError::IllegalFlag(char::from(bad)));
    }

    let mode = if flags.contains(&b'w') {
        LockMode::Write
    } else {
        LockMode::Read
    };
    let wait = if flags.contains(&b'n') {
        WaitPolicy::NonBlock
    } else {
        WaitPolicy::Block
    };
    Ok(LockRequest::new(mode, wait))
}
