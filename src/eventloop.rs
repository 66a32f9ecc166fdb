use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use ahash::AHashMap;

use crate::conn::{Conn, Detached};
use crate::error::Error;
use crate::events::{Action, EventHandler};
use crate::poller::{Note, Poller, Trigger};
use crate::ring::DispatchRing;
use crate::server::Shared;
use crate::sys;

/// How a loop reacts to readiness on a descriptor it has no connection for.
/// The monolithic-accept case and the sub-reactor case must never be
/// conflated, so the mode is explicit.
pub(crate) enum AcceptMode {
    /// Single-loop mode: this loop owns the listeners and installs accepted
    /// connections into its own table.
    Direct,
    /// Main reactor: accepted connections are published onto the dispatch
    /// ring for a sub-loop to claim.
    Publish {
        ring: Arc<DispatchRing<Conn>>,
        sequence: i64,
    },
    /// Sub-loop behind a main reactor: an unknown descriptor is a handoff
    /// race or a bug; log and drop, never close.
    Disabled,
}

pub(crate) struct EventLoop<H: EventHandler> {
    pub(crate) poller: Poller,
    pub(crate) core: LoopCore<H>,
}

impl<H: EventHandler> EventLoop<H> {
    /// Run the loop to completion. A clean `Action::Shutdown` unwind comes
    /// back as `Ok(())`; only genuine I/O failures surface as errors.
    pub(crate) fn run(self) -> Result<(), Error> {
        let EventLoop { poller, mut core } = self;

        let res = poller.polling(|fd, note| match note {
            Some(note) => core.on_note(&poller, note),
            None => core.on_event(&poller, fd),
        });

        // Whatever unwound the loop, surviving connections get a proper
        // close with their on_closed callback.
        let survivors: Vec<(RawFd, Conn)> = core.conns.drain().collect();
        for (fd, mut conn) in survivors {
            let _ = poller.delete(fd);
            conn.fd = -1;
            unsafe { libc::close(fd) };
            core.handler.on_closed(&mut conn, None);
        }

        match res {
            Err(Error::Shutdown) => Ok(()),
            other => other,
        }
    }
}

pub(crate) struct LoopCore<H: EventHandler> {
    idx: usize,
    conns: AHashMap<RawFd, Conn>,
    /// Scratch buffer shared by every read and recvfrom on this loop.
    packet: Box<[u8]>,
    handler: H,
    shared: Arc<Shared>,
    accept_mode: AcceptMode,
    /// This loop's own trigger, stamped onto connections for wake handles.
    trigger: Trigger,
}

impl<H: EventHandler> LoopCore<H> {
    pub(crate) fn new(
        idx: usize,
        handler: H,
        shared: Arc<Shared>,
        accept_mode: AcceptMode,
        trigger: Trigger,
        read_buffer_size: usize,
    ) -> Self {
        LoopCore {
            idx,
            conns: AHashMap::new(),
            packet: vec![0u8; read_buffer_size].into_boxed_slice(),
            handler,
            shared,
            accept_mode,
            trigger,
        }
    }

    /// Readiness dispatch for one descriptor. The transition order is
    /// load-bearing: open before anything else, flush pending output before
    /// honouring a deferred action, and read only when nothing is pending.
    fn on_event(&mut self, poller: &Poller, fd: RawFd) -> Result<(), Error> {
        let Some(conn) = self.conns.get(&fd) else {
            return match self.accept_mode {
                AcceptMode::Disabled => {
                    tracing::warn!(fd, loop_idx = self.idx, "readiness for unknown descriptor");
                    Ok(())
                }
                _ => self.accept(poller, fd),
            };
        };

        let (opened, has_output, action) = (conn.opened, !conn.outbound.is_empty(), conn.action);
        if !opened {
            self.opened(poller, fd)
        } else if has_output {
            self.write(poller, fd)
        } else if action != Action::None {
            self.action(poller, fd)
        } else {
            self.read(poller, fd)
        }
    }

    fn on_note(&mut self, poller: &Poller, note: Note) -> Result<(), Error> {
        match note {
            Note::Tick => {
                let (delay, action) = self.handler.tick();
                // The ticker is parked on this channel; a full slot means it
                // has not slept yet and will re-trigger on its own.
                let _ = self.shared.tick_tx.try_send(delay);
                if action == Action::Shutdown {
                    Err(Error::Shutdown)
                } else {
                    Ok(())
                }
            }
            Note::Shutdown => Err(Error::Shutdown),
            Note::Wake { fd, id } => match self.conns.get(&fd) {
                Some(conn) if conn.id == id => self.wake(poller, fd),
                _ => {
                    tracing::trace!(fd, loop_idx = self.idx, "dropping stale wake");
                    Ok(())
                }
            },
            Note::Register { fd, conn } => {
                self.conns.insert(fd, *conn);
                if let Err(e) = poller.add_read_write(fd) {
                    tracing::warn!(fd, error = %e, "failed to register dispatched connection");
                    return self.close_conn(poller, fd, Some(e));
                }
                tracing::debug!(fd, loop_idx = self.idx, "installed dispatched connection");
                Ok(())
            }
        }
    }

    /// Readiness on a listening descriptor: accept one stream connection or
    /// service one datagram.
    fn accept(&mut self, poller: &Poller, fd: RawFd) -> Result<(), Error> {
        let Some(listener_idx) = self
            .shared
            .listeners
            .iter()
            .position(|l| l.raw_fd() == fd)
        else {
            tracing::warn!(fd, loop_idx = self.idx, "readiness for unknown descriptor");
            return Ok(());
        };

        if self.shared.listeners[listener_idx].is_datagram() {
            return self.udp_read(poller, listener_idx, fd);
        }

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let nfd = unsafe {
            libc::accept(
                fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if nfd < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                // Nothing left to accept this cycle; readiness will re-fire.
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(()),
                _ => Err(err.into()),
            };
        }
        if let Err(err) = sys::set_nonblocking(nfd, true) {
            unsafe { libc::close(nfd) };
            return Err(err.into());
        }
        sys::set_nosigpipe(nfd);

        let remote = sys::to_socket_addr(&storage, len);
        let conn = Conn::accepted(nfd, remote, listener_idx);
        tracing::debug!(fd = nfd, remote = ?remote, "accepted connection");

        match &mut self.accept_mode {
            AcceptMode::Direct => {
                let mut conn = conn;
                conn.init_buffers(self.shared.buffer_capacity);
                conn.loop_idx = self.idx;
                conn.trigger = Some(self.trigger.clone());
                self.conns.insert(nfd, conn);
                if let Err(e) = poller.add_read_write(nfd) {
                    tracing::warn!(fd = nfd, error = %e, "failed to register accepted connection");
                    return self.close_conn(poller, nfd, Some(e));
                }
                Ok(())
            }
            AcceptMode::Publish { ring, sequence } => {
                let seq = *sequence;
                *sequence += 1;
                if let Err(conn) = ring.publish(seq, conn) {
                    // Ring closed under us: shutting down, drop the socket.
                    drop(conn);
                }
                Ok(())
            }
            AcceptMode::Disabled => Ok(()),
        }
    }

    /// One inbound datagram: synthesize an ephemeral connection, run react,
    /// and answer to the source address. No state survives the call.
    fn udp_read(&mut self, _poller: &Poller, listener_idx: usize, fd: RawFd) -> Result<(), Error> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd,
                self.packet.as_mut_ptr() as *mut libc::c_void,
                self.packet.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if n <= 0 {
            return Ok(());
        }
        let Some(remote) = sys::to_socket_addr(&storage, len) else {
            return Ok(());
        };

        let local = self.shared.listeners[listener_idx].addr();
        let mut conn = Conn::datagram(
            listener_idx,
            local,
            remote,
            &self.packet[..n as usize],
            self.idx,
        );
        let (out, action) = self.handler.react(&mut conn);
        if let Some(out) = out
            && !out.is_empty()
        {
            self.handler.pre_write();
            let (sa, sa_len) = sys::to_sockaddr(&remote);
            let sent = unsafe {
                libc::sendto(
                    fd,
                    out.as_ptr() as *const libc::c_void,
                    out.len(),
                    0,
                    &sa as *const _ as *const libc::sockaddr,
                    sa_len,
                )
            };
            if sent < 0 {
                tracing::debug!(fd, remote = %remote, error = %io::Error::last_os_error(), "sendto failed");
            }
        }
        if action == Action::Shutdown {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// First readiness after registration: mark open, fire on_opened, flush
    /// any greeting, and drop write interest if nothing is pending.
    fn opened(&mut self, poller: &Poller, fd: RawFd) -> Result<(), Error> {
        let (out, keepalive) = {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return Ok(());
            };
            conn.opened = true;
            conn.local_addr = self
                .shared
                .listeners
                .get(conn.listener_idx)
                .map(|l| l.addr());
            let is_stream = self
                .shared
                .listeners
                .get(conn.listener_idx)
                .is_some_and(|l| !l.is_datagram());
            let (out, opts, action) = self.handler.on_opened(conn);
            conn.action = action;
            // Keepalive only makes sense on stream sockets.
            let keepalive = if is_stream { opts.tcp_keep_alive } else { None };
            (out, keepalive)
        };

        if let Some(idle) = keepalive
            && let Err(e) = sys::set_tcp_keepalive(fd, idle)
        {
            tracing::debug!(fd, error = %e, "failed to enable keepalive");
        }

        if let Some(out) = out
            && !out.is_empty()
        {
            self.send_out(poller, fd, &out)?;
        }

        if let Some(conn) = self.conns.get(&fd)
            && conn.outbound.is_empty()
            && conn.action == Action::None
        {
            poller.mod_read(fd)?;
        }
        Ok(())
    }

    /// Writable with pending output: flush as much as the socket takes.
    fn write(&mut self, poller: &Poller, fd: RawFd) -> Result<(), Error> {
        self.handler.pre_write();

        let res = {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return Ok(());
            };
            let buf = conn.outbound.as_slice();
            let n = sys::send(fd, buf);
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                conn.outbound.advance(n as usize);
                Ok(())
            }
        };
        match res {
            Err(e) if would_block(&e) => return Ok(()),
            Err(e) => return self.close_conn(poller, fd, Some(e)),
            Ok(()) => {}
        }

        if let Some(conn) = self.conns.get(&fd)
            && conn.outbound.is_empty()
            && conn.action == Action::None
        {
            poller.mod_read(fd)?;
        }
        Ok(())
    }

    /// Pending action with no buffered output left.
    fn action(&mut self, poller: &Poller, fd: RawFd) -> Result<(), Error> {
        let action = match self.conns.get(&fd) {
            Some(conn) => conn.action,
            None => return Ok(()),
        };
        match action {
            Action::Close => return self.close_conn(poller, fd, None),
            Action::Shutdown => return Err(Error::Shutdown),
            Action::Detach => return self.detach_conn(poller, fd),
            Action::None => {}
        }

        if let Some(conn) = self.conns.get_mut(&fd) {
            conn.action = Action::None;
            if conn.outbound.is_empty() {
                poller.mod_read(fd)?;
            }
        }
        Ok(())
    }

    /// Readable with nothing else pending: pull bytes, run react, flush.
    fn read(&mut self, poller: &Poller, fd: RawFd) -> Result<(), Error> {
        let n = unsafe {
            libc::read(
                fd,
                self.packet.as_mut_ptr() as *mut libc::c_void,
                self.packet.len(),
            )
        };
        if n == 0 {
            return self.close_conn(poller, fd, None);
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            if would_block(&err) {
                return Ok(());
            }
            return self.close_conn(poller, fd, Some(err));
        }

        let out = {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return Ok(());
            };
            conn.inbound.push(&self.packet[..n as usize]);
            let (out, action) = self.handler.react(conn);
            conn.action = action;
            out
        };
        if let Some(out) = out
            && !out.is_empty()
        {
            self.send_out(poller, fd, &out)?;
        }

        if let Some(conn) = self.conns.get(&fd)
            && (!conn.outbound.is_empty() || conn.action != Action::None)
        {
            poller.mod_read_write(fd)?;
        }
        Ok(())
    }

    /// A wake note for a live connection: run react against whatever is
    /// buffered, without touching the socket.
    fn wake(&mut self, poller: &Poller, fd: RawFd) -> Result<(), Error> {
        let out = {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return Ok(());
            };
            let (out, action) = self.handler.react(conn);
            conn.action = action;
            out
        };
        if let Some(out) = out
            && !out.is_empty()
        {
            self.send_out(poller, fd, &out)?;
        }

        // Unlike a read, a wake can land while write interest is still set
        // from an earlier transition (e.g. a prior wake in the same note
        // burst), so the registration is settled in both directions here.
        if let Some(conn) = self.conns.get(&fd) {
            if !conn.outbound.is_empty() || conn.action != Action::None {
                poller.mod_read_write(fd)?;
            } else {
                poller.mod_read(fd)?;
            }
        }
        Ok(())
    }

    /// Enqueue output and attempt one immediate write to shave the latency
    /// of waiting for the next writable event. EAGAIN and partial writes
    /// leave the remainder buffered for the write transition.
    fn send_out(&mut self, poller: &Poller, fd: RawFd, out: &[u8]) -> Result<(), Error> {
        let res = {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return Ok(());
            };
            conn.outbound.push(out);
            let buf = conn.outbound.as_slice();
            let n = sys::send(fd, buf);
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                conn.outbound.advance(n as usize);
                Ok(())
            }
        };
        match res {
            Err(e) if would_block(&e) => Ok(()),
            Err(e) => self.close_conn(poller, fd, Some(e)),
            Ok(()) => Ok(()),
        }
    }

    /// Remove the connection, close its descriptor, and let the handler see
    /// the terminating error. Only a Shutdown request propagates further.
    fn close_conn(&mut self, poller: &Poller, fd: RawFd, err: Option<io::Error>) -> Result<(), Error> {
        let Some(mut conn) = self.conns.remove(&fd) else {
            return Ok(());
        };
        let _ = poller.delete(fd);
        conn.fd = -1;
        unsafe { libc::close(fd) };
        tracing::debug!(fd, loop_idx = self.idx, error = ?err, "closed connection");

        match self.handler.on_closed(&mut conn, err.as_ref()) {
            Action::Shutdown => Err(Error::Shutdown),
            _ => Ok(()),
        }
    }

    /// Hand the descriptor to user code: deregister, restore blocking mode,
    /// and pass over a handle carrying the unconsumed inbound bytes. A
    /// handler that does not take detached connections gets close semantics.
    fn detach_conn(&mut self, poller: &Poller, fd: RawFd) -> Result<(), Error> {
        let Some(mut conn) = self.conns.remove(&fd) else {
            return Ok(());
        };
        let _ = poller.delete(fd);
        sys::set_nonblocking(fd, false)?;

        let pending = conn.take_inbound();
        conn.fd = -1;
        let detached = Detached::new(unsafe { OwnedFd::from_raw_fd(fd) }, pending);
        tracing::debug!(fd, loop_idx = self.idx, "detached connection");

        match self.handler.on_detached(&mut conn, detached) {
            Some(Action::Shutdown) => Err(Error::Shutdown),
            Some(_) => Ok(()),
            None => {
                // The handle was dropped above, which closed the descriptor.
                match self.handler.on_closed(&mut conn, None) {
                    Action::Shutdown => Err(Error::Shutdown),
                    _ => Ok(()),
                }
            }
        }
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Opts;
    use bytes::Bytes;
    use std::time::Duration;

    struct Probe {
        reacts: usize,
        closes: usize,
    }

    impl EventHandler for Probe {
        fn create_for_loop(_index: usize) -> Self {
            Probe {
                reacts: 0,
                closes: 0,
            }
        }

        fn on_opened(&mut self, _conn: &mut Conn) -> (Option<Bytes>, Opts, Action) {
            (None, Opts::default(), Action::None)
        }

        fn on_closed(&mut self, _conn: &mut Conn, _err: Option<&io::Error>) -> Action {
            self.closes += 1;
            Action::None
        }

        fn react(&mut self, _conn: &mut Conn) -> (Option<Bytes>, Action) {
            self.reacts += 1;
            (None, Action::None)
        }
    }

    fn test_core(
        accept_mode: AcceptMode,
    ) -> (
        Poller,
        LoopCore<Probe>,
        crossbeam_channel::Receiver<Duration>,
    ) {
        let poller = Poller::new().unwrap();
        let trigger = poller.trigger_handle();
        let (shared, tick_rx) = Shared::for_tests();
        let core = LoopCore::new(0, Probe::create_for_loop(0), shared, accept_mode, trigger, 4096);
        (poller, core, tick_rx)
    }

    /// A registered socket descriptor the test owns: the poller accepts it
    /// and the connection's drop can close it.
    fn registered_conn_fd(poller: &Poller) -> (std::net::UdpSocket, RawFd) {
        use std::os::fd::AsRawFd;

        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = unsafe { libc::dup(socket.as_raw_fd()) };
        assert!(fd >= 0);
        poller.add_read(fd).unwrap();
        (socket, fd)
    }

    #[test]
    fn stale_wake_is_dropped() {
        let (poller, mut core, _tick_rx) = test_core(AcceptMode::Disabled);
        let (_socket, fd) = registered_conn_fd(&poller);
        let conn = Conn::accepted(fd, None, 0);
        let live_id = conn.id;
        core.conns.insert(fd, conn);

        // A wake carrying a mismatched id must not reach react.
        core.on_note(&poller, Note::Wake { fd, id: live_id + 1 })
            .unwrap();
        assert_eq!(core.handler.reacts, 0);

        core.on_note(&poller, Note::Wake { fd, id: live_id })
            .unwrap();
        assert_eq!(core.handler.reacts, 1);
    }

    /// Parks a close on the first react, then rescinds it on the next.
    struct FlipFlop {
        calls: usize,
    }

    impl EventHandler for FlipFlop {
        fn create_for_loop(_index: usize) -> Self {
            FlipFlop { calls: 0 }
        }

        fn react(&mut self, _conn: &mut Conn) -> (Option<Bytes>, Action) {
            self.calls += 1;
            if self.calls == 1 {
                (None, Action::Close)
            } else {
                (None, Action::None)
            }
        }
    }

    #[test]
    fn back_to_back_wakes_settle_interest_to_read_only() {
        let poller = Poller::new().unwrap();
        let trigger = poller.trigger_handle();
        let (shared, _tick_rx) = Shared::for_tests();
        let mut core = LoopCore::new(
            0,
            FlipFlop::create_for_loop(0),
            shared,
            AcceptMode::Disabled,
            trigger.clone(),
            4096,
        );

        let (_socket, fd) = registered_conn_fd(&poller);
        let conn = Conn::accepted(fd, None, 0);
        let id = conn.id;
        core.conns.insert(fd, conn);

        // Two wakes in one note burst, with no poll in between: the first
        // parks a Close action and promotes interest to read+write, the
        // second overwrites the action with None and must demote back.
        core.on_note(&poller, Note::Wake { fd, id }).unwrap();
        core.on_note(&poller, Note::Wake { fd, id }).unwrap();
        assert_eq!(core.handler.calls, 2);

        // Probe the registered interest through the poller itself: the
        // socket is quiet but always write-ready, so any leftover write
        // interest makes the level-triggered wait report it immediately.
        // With read-only interest restored, only the delayed shutdown note
        // arrives.
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            let _ = trigger.trigger(Note::Shutdown);
        });
        let mut fd_events = 0usize;
        let res = poller.polling(|ready_fd, note| {
            if ready_fd == fd {
                fd_events += 1;
                return Err(Error::Shutdown);
            }
            match note {
                Some(Note::Shutdown) => Err(Error::Shutdown),
                _ => Ok(()),
            }
        });
        assert!(matches!(res, Err(Error::Shutdown)));
        assert_eq!(
            fd_events, 0,
            "write interest must be demoted once output is flushed and no action is pending"
        );
        stopper.join().unwrap();
    }

    #[test]
    fn wake_for_unregistered_descriptor_is_dropped() {
        let (poller, mut core, _tick_rx) = test_core(AcceptMode::Disabled);
        core.on_note(&poller, Note::Wake { fd: 42, id: 1 }).unwrap();
        assert_eq!(core.handler.reacts, 0);
        assert!(core.conns.is_empty());
    }

    #[test]
    fn unknown_descriptor_on_sub_loop_is_not_closed() {
        let (poller, mut core, _tick_rx) = test_core(AcceptMode::Disabled);
        // The descriptor may belong to another loop or be in transit; the
        // dispatch must neither close it nor fail the loop.
        core.on_event(&poller, 99).unwrap();
        assert_eq!(core.handler.closes, 0);
    }

    #[test]
    fn shutdown_note_unwinds() {
        let (poller, mut core, _tick_rx) = test_core(AcceptMode::Disabled);
        assert!(matches!(
            core.on_note(&poller, Note::Shutdown),
            Err(Error::Shutdown)
        ));
    }

    #[test]
    fn tick_publishes_delay() {
        let (poller, mut core, tick_rx) = test_core(AcceptMode::Disabled);
        core.on_note(&poller, Note::Tick).unwrap();
        assert_eq!(tick_rx.try_recv().unwrap(), Duration::from_secs(1));
    }
}
