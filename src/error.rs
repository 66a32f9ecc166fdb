use std::io;

/// Errors surfaced by the server core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A syscall failed with an unrecoverable errno. EAGAIN, EWOULDBLOCK and
    /// EINTR never reach this variant.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Internal sentinel that unwinds a polling loop when a callback returns
    /// `Action::Shutdown`. Mapped to a clean exit before reaching the caller.
    #[error("shutting down")]
    Shutdown,
}
