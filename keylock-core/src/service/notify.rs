//! Wakes one suspended connection after a key is released.

use tracing::{debug, info};

use crate::lock::{display_key, AcquireOutcome};
use crate::metrics::Metrics;
use crate::protocol::Reply;
use crate::service::CoreState;
use crate::session::{ConnectionId, SessionState};

/// Retry the lock request of the first blocked connection matching
/// `released_key`, in registry wake order. Returns the connection that was
/// retried, if any. At most one waiter is retried per call.
pub(crate) fn wake_one(
    state: &mut CoreState,
    metrics: &Metrics,
    released_key: &[u8],
    releaser: ConnectionId,
) -> Option<ConnectionId> {
    let waiter = state.registry.find_blocked(released_key, releaser)?;
    let entry = state.registry.get_mut(waiter)?;
    let pending = entry.pending.clone()?;

    match state.table.acquire(&pending.key, pending.request) {
        AcquireOutcome::Denied => {
            entry.session = SessionState::Init;
            entry.pending = None;
            metrics.record_lock_denied();
            if !entry.wake(Reply::LockFailed) {
                debug!(conn_id = %waiter, "waiter went away before denial was delivered");
            }
        }
        AcquireOutcome::MustWait => {
            metrics.record_lock_blocked();
            debug!(
                conn_id = %waiter,
                key = %display_key(&pending.key),
                released = %display_key(released_key),
                "waiter retried but key is still busy"
            );
        }
        AcquireOutcome::Granted => {
            entry.session = SessionState::Locked;
            metrics.record_lock_granted();
            // a vanished waiter is still locked in the registry and releases on disconnect
            if !entry.wake(Reply::LockSuccess) {
                debug!(conn_id = %waiter, "waiter went away before grant was delivered");
            }
        }
    }

    info!(
        conn_id = %waiter,
        releaser = %releaser,
        key = %display_key(&pending.key),
        session = %entry.session,
        "notified blocked connection"
    );
    Some(waiter)
}
