//! BSD-family backend: kqueue with EVFILT_USER as the wake primitive.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;

const WAIT_CAPACITY: usize = 256;

/// Ident of the EVFILT_USER event; doubles as the reserved descriptor
/// value 0 in the dispatch callback.
const WAKE_IDENT: usize = 0;

pub(crate) struct Selector {
    kq: Arc<OwnedFd>,
}

// kevent field types vary across the BSDs; build changes from a zeroed
// struct and let the casts absorb the differences.
fn kevent_change(ident: usize, filter: libc::c_int, flags: libc::c_int, fflags: u32) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = ident as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.fflags = fflags as _;
    ev
}

impl Selector {
    pub(crate) fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        let sel = Selector {
            kq: Arc::new(unsafe { OwnedFd::from_raw_fd(kq) }),
        };
        sel.change(kevent_change(
            WAKE_IDENT,
            libc::EVFILT_USER as libc::c_int,
            (libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR) as libc::c_int,
            0,
        ))?;
        Ok(sel)
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker {
            kq: self.kq.clone(),
        }
    }

    fn change(&self, ev: libc::kevent) -> io::Result<()> {
        let ret = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &ev,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn set_filter(&self, fd: RawFd, filter: libc::c_int, enabled: bool) -> io::Result<()> {
        if enabled {
            self.change(kevent_change(
                fd as usize,
                filter,
                (libc::EV_ADD | libc::EV_ENABLE) as libc::c_int,
                0,
            ))
        } else {
            match self.change(kevent_change(
                fd as usize,
                filter,
                libc::EV_DELETE as libc::c_int,
                0,
            )) {
                // Deleting a filter that was never added is fine.
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
                other => other,
            }
        }
    }

    pub(crate) fn add(&self, fd: RawFd, read: bool, write: bool) -> io::Result<()> {
        self.set_filter(fd, libc::EVFILT_READ as libc::c_int, read)?;
        self.set_filter(fd, libc::EVFILT_WRITE as libc::c_int, write)
    }

    pub(crate) fn modify(&self, fd: RawFd, read: bool, write: bool) -> io::Result<()> {
        self.add(fd, read, write)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.set_filter(fd, libc::EVFILT_READ as libc::c_int, false)?;
        self.set_filter(fd, libc::EVFILT_WRITE as libc::c_int, false)
    }

    /// Block until readiness, appending ready descriptors to `ready`
    /// (0 for the wake event). Retries EINTR.
    pub(crate) fn wait(&self, ready: &mut Vec<RawFd>) -> io::Result<()> {
        let mut events: [libc::kevent; WAIT_CAPACITY] = unsafe { mem::zeroed() };
        let n = loop {
            let ret = unsafe {
                libc::kevent(
                    self.kq.as_raw_fd(),
                    ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    WAIT_CAPACITY as libc::c_int,
                    ptr::null(),
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
            if ev.filter as libc::c_int == libc::EVFILT_USER as libc::c_int {
                ready.push(0);
            } else {
                ready.push(ev.ident as RawFd);
            }
        }
        Ok(())
    }
}

/// Wakes a selector from any thread by triggering its EVFILT_USER event.
#[derive(Clone)]
pub(crate) struct Waker {
    kq: Arc<OwnedFd>,
}

impl Waker {
    pub(crate) fn wake(&self) -> io::Result<()> {
        let ev = kevent_change(
            WAKE_IDENT,
            libc::EVFILT_USER as libc::c_int,
            0,
            libc::NOTE_TRIGGER,
        );
        let ret = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &ev,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}
