use std::io;
use std::time::Duration;

use bytes::Bytes;

use crate::conn::{Conn, Detached};

/// Directive returned by callbacks to the owning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep the connection as-is.
    #[default]
    None,
    /// Close the connection once pending output has been flushed.
    Close,
    /// Unwind every loop and stop the server.
    Shutdown,
    /// Hand the descriptor over to user code via `on_detached`.
    Detach,
}

/// Per-connection options returned by `on_opened`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Opts {
    /// Enable TCP keepalive with this idle time. Ignored for datagram
    /// listeners.
    pub tcp_keep_alive: Option<Duration>,
}

/// The callback contract between the core and user code.
///
/// Every method has a default implementation, so a handler overrides only
/// what it needs. One handler instance exists per loop, built by
/// [`create_for_loop`](EventHandler::create_for_loop); indices `0..n` are the
/// event loops and index `n` is the main reactor (which only sees datagram
/// traffic and accepts). Callbacks for a given connection always run on its
/// owning loop's thread, serialized.
pub trait EventHandler: Send + Sized + 'static {
    /// Set to `true` to run a ticker: `tick` is then invoked periodically on
    /// loop 0, paced by the delay it returns.
    const TICK: bool = false;

    /// Build the handler instance for one loop.
    fn create_for_loop(index: usize) -> Self;

    /// First event on a new connection, before any `react`. The returned
    /// bytes are queued for transmission.
    fn on_opened(&mut self, _conn: &mut Conn) -> (Option<Bytes>, Opts, Action) {
        (None, Opts::default(), Action::None)
    }

    /// Invoked after a connection's descriptor has been closed. `err` is the
    /// terminating I/O error, if any. Returning `Action::Shutdown` unwinds
    /// the server; other actions are ignored.
    fn on_closed(&mut self, _conn: &mut Conn, _err: Option<&io::Error>) -> Action {
        Action::None
    }

    /// Receives ownership of a detached descriptor. The default
    /// implementation returns `None`, which makes `Action::Detach` behave
    /// like `Action::Close`: the handle is dropped (closing the descriptor)
    /// and `on_closed` fires.
    fn on_detached(&mut self, _conn: &mut Conn, _detached: Detached) -> Option<Action> {
        None
    }

    /// Drive the application protocol: consume inbound bytes from the
    /// connection and return bytes to transmit. Invoked after each
    /// successful read and on explicit wakes.
    fn react(&mut self, _conn: &mut Conn) -> (Option<Bytes>, Action) {
        (None, Action::None)
    }

    /// Hint that bytes are about to be written to a socket.
    fn pre_write(&mut self) {}

    /// Periodic callback on loop 0 (only when [`TICK`](EventHandler::TICK)
    /// is set). Returns the delay until the next tick.
    fn tick(&mut self) -> (Duration, Action) {
        (Duration::from_secs(1), Action::None)
    }
}
