use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::buffer::Buffer;
use crate::events::Action;
use crate::poller::{Note, Trigger};

/// Monotonic id source for stale-wake detection. A descriptor number can be
/// reused by the kernel the instant a connection closes; the id cannot.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A connection owned by one event loop.
///
/// All mutation happens on the owning loop's thread. Cross-thread access is
/// limited to the [`Wake`] handle, which routes through the loop's trigger.
pub struct Conn {
    pub(crate) fd: RawFd,
    pub(crate) id: u64,
    pub(crate) listener_idx: usize,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) inbound: Buffer,
    pub(crate) outbound: Buffer,
    pub(crate) opened: bool,
    pub(crate) action: Action,
    pub(crate) loop_idx: usize,
    pub(crate) trigger: Option<Trigger>,
}

impl Conn {
    /// A freshly accepted stream connection. Buffers stay unallocated until
    /// the owning consumer initializes them.
    pub(crate) fn accepted(fd: RawFd, remote_addr: Option<SocketAddr>, listener_idx: usize) -> Self {
        Conn {
            fd,
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            listener_idx,
            local_addr: None,
            remote_addr,
            inbound: Buffer::new(),
            outbound: Buffer::new(),
            opened: false,
            action: Action::None,
            loop_idx: 0,
            trigger: None,
        }
    }

    /// An ephemeral connection synthesized for one inbound datagram.
    pub(crate) fn datagram(
        listener_idx: usize,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        payload: &[u8],
        loop_idx: usize,
    ) -> Self {
        let mut inbound = Buffer::with_capacity(payload.len());
        inbound.push(payload);
        Conn {
            fd: -1,
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            listener_idx,
            local_addr: Some(local_addr),
            remote_addr: Some(remote_addr),
            inbound,
            outbound: Buffer::new(),
            opened: true,
            action: Action::None,
            loop_idx,
            trigger: None,
        }
    }

    pub(crate) fn init_buffers(&mut self, capacity: usize) {
        self.inbound = Buffer::with_capacity(capacity);
        self.outbound = Buffer::with_capacity(capacity);
    }

    /// Unread inbound bytes.
    pub fn inbound(&self) -> &[u8] {
        self.inbound.as_slice()
    }

    /// Mark `n` inbound bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        self.inbound.advance(n);
    }

    /// Take and clear all unread inbound bytes.
    pub fn take_inbound(&mut self) -> Bytes {
        let out = Bytes::copy_from_slice(self.inbound.as_slice());
        self.inbound.clear();
        out
    }

    /// Local address of the listener that produced this connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Peer address.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Index of the listener this connection arrived on.
    pub fn listener_index(&self) -> usize {
        self.listener_idx
    }

    /// Index of the owning loop.
    pub fn loop_index(&self) -> usize {
        self.loop_idx
    }

    /// A cloneable handle that schedules `react` on this connection from any
    /// thread. `None` for ephemeral datagram connections.
    pub fn wake_handle(&self) -> Option<Wake> {
        self.trigger.as_ref().map(|trigger| Wake {
            trigger: trigger.clone(),
            fd: self.fd,
            id: self.id,
        })
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        // The loop closes descriptors at well-defined transition points and
        // clears the field; this catches connections dropped in transit
        // (ring slots, undelivered handoff notes) during shutdown.
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

/// Cross-thread wake handle for a registered connection.
///
/// If the connection has been closed (and its descriptor possibly reused by
/// another connection), the wake is detected as stale by the owning loop and
/// dropped without side effect.
#[derive(Clone)]
pub struct Wake {
    trigger: Trigger,
    fd: RawFd,
    id: u64,
}

impl Wake {
    /// Request a `react` callback on the connection's owning loop. Returns
    /// `false` if the loop has already shut down.
    pub fn wake(&self) -> bool {
        self.trigger
            .trigger(Note::Wake {
                fd: self.fd,
                id: self.id,
            })
            .is_ok()
    }
}

/// A descriptor whose ownership has been transferred out of the core.
///
/// The descriptor is back in blocking mode. Reads drain the bytes that were
/// already buffered inbound (but not consumed by `react`) before touching
/// the socket.
pub struct Detached {
    fd: OwnedFd,
    pending: Bytes,
}

impl Detached {
    pub(crate) fn new(fd: OwnedFd, pending: Bytes) -> Self {
        Detached { fd, pending }
    }

    /// Bytes that were received before the detach but not consumed.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Give up the wrapper, returning the raw descriptor. Buffered pending
    /// bytes are discarded; read them out first if they matter.
    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl AsRawFd for Detached {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl io::Read for Detached {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending = self.pending.slice(n..);
            return Ok(n);
        }
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

impl io::Write for Detached {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let ret = crate::sys::send(self.fd.as_raw_fd(), buf);
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
