use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::trace;

use crate::error::LockError;
use crate::lock::{display_key, AcquireOutcome, LockMode, LockRequest, WaitPolicy};

/// A live lock on one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub mode: LockMode,
    pub refcount: u32,
    /// Unix seconds at which the entry was created.
    pub created_at: u64,
}

/// Key → entry map implementing the admission policy.
///
/// An entry exists exactly while its refcount is positive, and its mode is the
/// mode of the request that created it.
#[derive(Debug, Default)]
pub struct LockTable {
    entries: HashMap<Vec<u8>, LockEntry>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, key: &[u8], request: LockRequest) -> AcquireOutcome {
        let Some(entry) = self.entries.get_mut(key) else {
            self.entries.insert(
                key.to_vec(),
                LockEntry {
                    mode: request.mode,
                    refcount: 1,
                    created_at: unix_now(),
                },
            );
            trace!(key = %display_key(key), mode = %request.mode, "created lock entry");
            return AcquireOutcome::Granted;
        };

        trace!(key = %display_key(key), held = %entry.mode, refcount = entry.refcount, "found lock entry");

        let conflicts = request.mode == LockMode::Write || entry.mode == LockMode::Write;
        if conflicts {
            return match request.wait {
                WaitPolicy::NonBlock => AcquireOutcome::Denied,
                WaitPolicy::Block => AcquireOutcome::MustWait,
            };
        }

        entry.refcount += 1;
        AcquireOutcome::Granted
    }

    pub fn release(&mut self, key: &[u8]) -> Result<(), LockError> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| LockError::NotFound(display_key(key).into_owned()))?;

        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            self.entries.remove(key);
            trace!(key = %display_key(key), "removed lock entry");
        }
        Ok(())
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&LockEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}
