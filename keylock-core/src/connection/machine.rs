//! I/O lifecycle of a connection as a pure transition function.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoState {
    /// Accepting new connections; only the listener is ever in this state.
    Listening,
    #[default]
    Reading,
    Writing,
    /// A lock request was suspended and the connection must re-arm.
    Waiting,
    Closing,
}

impl fmt::Display for IoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoState::Listening => "listening",
            IoState::Reading => "reading",
            IoState::Writing => "writing",
            IoState::Waiting => "waiting",
            IoState::Closing => "closing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The listener handed a new socket off to its own task.
    Accepted,
    ReplyQueued,
    /// A wakeup reply from the notifier was queued.
    Woken,
    MustWait,
    DataArrived,
    ReadWouldBlock,
    PartialWrite,
    WriteWouldBlock,
    WriteComplete { close_after: bool },
    Rearmed,
    EndOfStream,
    IoError,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    AwaitReadable,
    AwaitWritable,
    Close,
}

/// Compute the next state and the readiness the connection has to wait for.
///
/// Events that make no sense in the current state leave it unchanged.
pub fn transition(state: IoState, event: Event) -> (IoState, Action) {
    use IoState::*;

    match (state, event) {
        (Closing, _) => (Closing, Action::Close),
        (_, Event::EndOfStream | Event::IoError | Event::Quit) => (Closing, Action::Close),

        (Listening, Event::Accepted) => (Listening, Action::AwaitReadable),

        (Reading, Event::DataArrived) => (Reading, Action::None),
        (Reading, Event::ReplyQueued | Event::Woken) => (Writing, Action::None),
        (Reading, Event::MustWait) => (Waiting, Action::None),
        (Reading, Event::ReadWouldBlock) => (Reading, Action::AwaitReadable),

        (Writing, Event::PartialWrite) => (Writing, Action::None),
        (Writing, Event::WriteWouldBlock) => (Writing, Action::AwaitWritable),
        (Writing, Event::WriteComplete { close_after: false }) => (Reading, Action::None),
        (Writing, Event::WriteComplete { close_after: true }) => (Closing, Action::Close),

        (Waiting, Event::Rearmed) => (Reading, Action::AwaitReadable),

        (state, _) => (state, Action::None),
    }
}
