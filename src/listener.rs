use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Whether a listener carries a byte stream or datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stream,
    Datagram,
}

/// An already-bound listening socket handed to the core.
///
/// The core owns the descriptor for the server's whole lifetime and closes
/// it on teardown. Address resolution, SO_REUSEPORT and friends are the
/// caller's business.
pub struct Listener {
    fd: OwnedFd,
    addr: SocketAddr,
    transport: Transport,
}

impl Listener {
    /// Wrap an externally prepared socket. The descriptor must already be
    /// bound (and listening, for streams) and in non-blocking mode.
    pub fn new(fd: OwnedFd, addr: SocketAddr, transport: Transport) -> Self {
        Listener {
            fd,
            addr,
            transport,
        }
    }

    /// Adopt a bound std TCP listener, switching it to non-blocking mode.
    pub fn from_tcp(listener: std::net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        Ok(Listener {
            fd: listener.into(),
            addr,
            transport: Transport::Stream,
        })
    }

    /// Adopt a bound std UDP socket, switching it to non-blocking mode.
    pub fn from_udp(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let addr = socket.local_addr()?;
        Ok(Listener {
            fd: socket.into(),
            addr,
            transport: Transport::Datagram,
        })
    }

    /// Resolved local address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn is_datagram(&self) -> bool {
        self.transport == Transport::Datagram
    }
}
