use crate::metrics::Metrics;
use crate::protocol::{stored_key, Reply};
use crate::service::{CoreState, Outcome};

/// `find <key>`: looks the key up as `lock` would have stored it.
pub(super) fn find(state: &CoreState, key: &[u8]) -> Outcome {
    let reply = match state.table.lookup(stored_key(key)) {
        Some(entry) => Reply::KeyFound {
            mode: entry.mode,
            refcount: entry.refcount,
            created_at: entry.created_at,
        },
        None => Reply::KeyNotFound,
    };
    Outcome::Reply(reply)
}

pub(super) fn stats(metrics: &Metrics) -> Outcome {
    Outcome::Reply(Reply::Stats(metrics.snapshot()))
}

pub(super) fn help() -> Outcome {
    Outcome::Reply(Reply::Help)
}
