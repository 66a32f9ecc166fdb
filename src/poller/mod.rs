//! Readiness multiplexer with a cross-thread trigger channel.
//!
//! One poller per loop. Sockets are registered under their own descriptor
//! number; descriptor 0 is reserved for the trigger channel, so a callback
//! invoked with `fd == 0` always carries a [`Note`]. Triggers may fire from
//! any thread: the note goes onto a FIFO queue and the backend's wake
//! primitive (eventfd on Linux, EVFILT_USER on the BSDs) interrupts the
//! blocked wait.

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
use epoll::{Selector, Waker};

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
use kqueue::{Selector, Waker};

use std::os::fd::RawFd;

use crossbeam_channel::{Receiver, Sender};

use crate::conn::Conn;
use crate::error::Error;

/// Message injected into a loop through its trigger.
pub(crate) enum Note {
    /// Ticker pacing: run the tick callback (loop 0 only).
    Tick,
    /// Unwind the polling loop.
    Shutdown,
    /// Run `react` now for an already-registered connection. `id` guards
    /// against descriptor reuse.
    Wake { fd: RawFd, id: u64 },
    /// Main-reactor handoff: install the connection and register its
    /// descriptor.
    Register { fd: RawFd, conn: Box<Conn> },
}

pub(crate) struct Poller {
    sel: Selector,
    notes: Receiver<Note>,
    tx: Sender<Note>,
}

impl Poller {
    pub(crate) fn new() -> Result<Self, Error> {
        let sel = Selector::new()?;
        let (tx, notes) = crossbeam_channel::unbounded();
        Ok(Poller { sel, notes, tx })
    }

    /// A cheap handle for waking this poller from other threads.
    pub(crate) fn trigger_handle(&self) -> Trigger {
        Trigger {
            tx: self.tx.clone(),
            waker: self.sel.waker(),
        }
    }

    pub(crate) fn add_read(&self, fd: RawFd) -> std::io::Result<()> {
        self.sel.add(fd, true, false)
    }

    pub(crate) fn add_read_write(&self, fd: RawFd) -> std::io::Result<()> {
        self.sel.add(fd, true, true)
    }

    pub(crate) fn mod_read(&self, fd: RawFd) -> std::io::Result<()> {
        self.sel.modify(fd, true, false)
    }

    pub(crate) fn mod_read_write(&self, fd: RawFd) -> std::io::Result<()> {
        self.sel.modify(fd, true, true)
    }

    /// Deregister a descriptor without closing it.
    pub(crate) fn delete(&self, fd: RawFd) -> std::io::Result<()> {
        self.sel.delete(fd)
    }

    /// Block on readiness and dispatch until `cb` returns an error.
    ///
    /// Each ready descriptor is delivered as `cb(fd, None)`; each queued
    /// note as `cb(0, Some(note))`. EINTR is retried internally; any other
    /// wait failure is returned as `Error::Io`.
    pub(crate) fn polling<F>(&self, mut cb: F) -> Result<(), Error>
    where
        F: FnMut(RawFd, Option<Note>) -> Result<(), Error>,
    {
        let mut ready: Vec<RawFd> = Vec::with_capacity(128);
        loop {
            ready.clear();
            self.sel.wait(&mut ready)?;
            for &fd in &ready {
                if fd == 0 {
                    while let Ok(note) = self.notes.try_recv() {
                        cb(0, Some(note))?;
                    }
                } else {
                    cb(fd, None)?;
                }
            }
        }
    }
}

/// Cross-thread wake handle for one poller.
///
/// Notes from a single producer are delivered in order, each exactly once.
#[derive(Clone)]
pub(crate) struct Trigger {
    tx: Sender<Note>,
    waker: Waker,
}

impl Trigger {
    /// Enqueue a note and wake the poll loop. Fails once the owning loop has
    /// exited and dropped its receiver.
    pub(crate) fn trigger(&self, note: Note) -> Result<(), Error> {
        self.tx.send(note).map_err(|_| Error::Shutdown)?;
        self.waker.wake().map_err(Error::Io)
    }
}
