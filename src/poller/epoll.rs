//! Linux backend: epoll in level-triggered mode, woken by an eventfd.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Events returned per wait call. Level-triggered epoll re-reports anything
/// left unconsumed, so a small batch is fine.
const WAIT_CAPACITY: usize = 256;

pub(crate) struct Selector {
    ep: OwnedFd,
    event_fd: Arc<OwnedFd>,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Self> {
        let ep = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if ep < 0 {
            return Err(io::Error::last_os_error());
        }
        let ep = unsafe { OwnedFd::from_raw_fd(ep) };

        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if efd < 0 {
            return Err(io::Error::last_os_error());
        }
        let event_fd = Arc::new(unsafe { OwnedFd::from_raw_fd(efd) });

        // The eventfd carries the reserved descriptor value 0 in its event
        // payload so wakes and socket readiness share one dispatch path.
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: 0,
        };
        let ret = unsafe {
            libc::epoll_ctl(
                ep.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                event_fd.as_raw_fd(),
                &mut ev,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Selector { ep, event_fd })
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker {
            event_fd: self.event_fd.clone(),
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, read: bool, write: bool) -> io::Result<()> {
        let mut events = 0u32;
        if read {
            events |= libc::EPOLLIN as u32;
        }
        if write {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub(crate) fn add(&self, fd: RawFd, read: bool, write: bool) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_ADD, fd, read, write) {
            // Already registered: idempotent add is a modify.
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, read, write)
            }
            other => other,
        }
    }

    pub(crate) fn modify(&self, fd: RawFd, read: bool, write: bool) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, read, write)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let ret =
            unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Block until readiness, appending ready descriptors to `ready`
    /// (0 for the wake channel). Retries EINTR.
    pub(crate) fn wait(&self, ready: &mut Vec<RawFd>) -> io::Result<()> {
        let mut events: [libc::epoll_event; WAIT_CAPACITY] = unsafe { mem::zeroed() };
        let n = loop {
            let ret = unsafe {
                libc::epoll_wait(
                    self.ep.as_raw_fd(),
                    events.as_mut_ptr(),
                    WAIT_CAPACITY as libc::c_int,
                    -1,
                )
            };
            if ret >= 0 {
                break ret as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        for ev in &events[..n] {
            let token = ev.u64;
            if token == 0 {
                // Drain the eventfd counter so level-triggered polling does
                // not spin on it.
                let mut count = [0u8; 8];
                unsafe {
                    libc::read(
                        self.event_fd.as_raw_fd(),
                        count.as_mut_ptr() as *mut libc::c_void,
                        8,
                    );
                }
                ready.push(0);
            } else {
                ready.push(token as RawFd);
            }
        }
        Ok(())
    }
}

/// Wakes a selector from any thread by bumping its eventfd.
#[derive(Clone)]
pub(crate) struct Waker {
    event_fd: Arc<OwnedFd>,
}

impl Waker {
    pub(crate) fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.event_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // A saturated counter still leaves the eventfd readable.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}
