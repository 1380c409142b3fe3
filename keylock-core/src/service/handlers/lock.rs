use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::lock::{display_key, AcquireOutcome};
use crate::metrics::Metrics;
use crate::protocol::{check_key, parse_flags, stored_key, Reply};
use crate::service::{notify, CoreState, Outcome};
use crate::session::{ConnectionId, PendingLock, SessionState};

fn rejected(metrics: &Metrics, err: ProtocolError) -> Outcome {
    debug!(error = %err, "rejected lock command");
    metrics.record_protocol_error();
    Outcome::Reply(err.into())
}

/// `lock <key> <flags>`. Checks run in wire order: key length, session
/// state, then flags.
pub(super) fn lock(
    state: &mut CoreState,
    metrics: &Metrics,
    id: ConnectionId,
    key: &[u8],
    flags: &[u8],
) -> Outcome {
    if let Err(err) = check_key(key) {
        return rejected(metrics, err);
    }

    let Some(entry) = state.registry.get_mut(id) else {
        warn!(conn_id = %id, "lock command from unregistered connection");
        return Outcome::Close;
    };
    match entry.session {
        SessionState::Blocked => return Outcome::Reply(Reply::WaitingForLock),
        SessionState::Locked => return Outcome::Reply(Reply::AlreadyLocked),
        SessionState::Init => {}
    }

    let request = match parse_flags(flags) {
        Ok(request) => request,
        Err(err) => return rejected(metrics, err),
    };
    let key = stored_key(key);

    match state.table.acquire(key, request) {
        AcquireOutcome::Granted => {
            entry.session = SessionState::Locked;
            entry.pending = Some(PendingLock {
                key: key.to_vec(),
                request,
            });
            metrics.record_lock_granted();
            Outcome::Reply(Reply::LockSuccess)
        }
        AcquireOutcome::Denied => {
            entry.session = SessionState::Init;
            entry.pending = None;
            metrics.record_lock_denied();
            Outcome::Reply(Reply::LockFailed)
        }
        AcquireOutcome::MustWait => {
            entry.session = SessionState::Blocked;
            entry.pending = Some(PendingLock {
                key: key.to_vec(),
                request,
            });
            metrics.record_lock_blocked();
            debug!(key = %display_key(key), ?request, "lock request suspended");
            Outcome::Wait
        }
    }
}

/// `unlock`: release the held key and give one waiter a chance at it.
pub(super) fn unlock(state: &mut CoreState, metrics: &Metrics, id: ConnectionId) -> Outcome {
    let Some(entry) = state.registry.get_mut(id) else {
        warn!(conn_id = %id, "unlock command from unregistered connection");
        return Outcome::Close;
    };
    let Some(key) = entry.held_key().map(<[u8]>::to_vec) else {
        return Outcome::Reply(Reply::SequenceError);
    };
    entry.session = SessionState::Init;
    entry.pending = None;

    if let Err(err) = state.table.release(&key) {
        warn!(error = %err, "held lock missing from table on unlock");
        return Outcome::Reply(Reply::SequenceError);
    }
    metrics.record_unlock();
    notify::wake_one(state, metrics, &key, id);
    Outcome::Reply(Reply::UnlockSuccess)
}
