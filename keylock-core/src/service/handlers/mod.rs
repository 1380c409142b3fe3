use crate::metrics::Metrics;
use crate::protocol::{Command, Reply};
use crate::service::{CoreState, Outcome};
use crate::session::ConnectionId;

mod info;
mod lock;

pub(super) fn dispatch(
    state: &mut CoreState,
    metrics: &Metrics,
    id: ConnectionId,
    command: Command<'_>,
) -> Outcome {
    match command {
        Command::Lock { key, flags } => lock::lock(state, metrics, id, key, flags),
        Command::Unlock => lock::unlock(state, metrics, id),
        Command::Quit => Outcome::Close,
        Command::Stats => info::stats(metrics),
        Command::Help => info::help(),
        Command::Find { key } => info::find(state, key),
        Command::Unknown => Outcome::Reply(Reply::Unimplemented),
    }
}
