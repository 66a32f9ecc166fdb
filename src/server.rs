use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::conn::Conn;
use crate::error::Error;
use crate::eventloop::{AcceptMode, EventLoop, LoopCore};
use crate::events::EventHandler;
use crate::listener::Listener;
use crate::poller::{Note, Poller, Trigger};
use crate::ring::DispatchRing;
use crate::sys;

/// Grace period before the main reactor tears down the dispatcher, letting
/// in-flight ring commits drain to their consumers.
const DISPATCH_GRACE: Duration = Duration::from_millis(10);

/// Granularity at which the ticker notices a shutdown mid-sleep.
const TICKER_POLL: Duration = Duration::from_millis(50);

/// Server construction knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of event loops. 0 means one per CPU core. With a single loop
    /// the dispatcher is skipped and that loop accepts directly.
    pub num_loops: usize,
    /// Size of each loop's scratch read buffer.
    pub read_buffer_size: usize,
    /// Initial capacity of per-connection inbound/outbound buffers.
    pub buffer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_loops: 0,
            read_buffer_size: 64 * 1024,
            buffer_capacity: 4096,
        }
    }
}

/// State shared by every loop, the ticker and the shutdown handle.
pub(crate) struct Shared {
    pub(crate) listeners: Vec<Listener>,
    pub(crate) buffer_capacity: usize,
    pub(crate) tick_tx: Sender<Duration>,
    shutdown: AtomicBool,
    triggers: Vec<Trigger>,
}

impl Shared {
    /// Ask every loop to unwind. Idempotent; the first caller wins.
    pub(crate) fn signal_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            tracing::debug!("signalling shutdown to all loops");
            for trigger in &self.triggers {
                let _ = trigger.trigger(Note::Shutdown);
            }
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> (Arc<Self>, Receiver<Duration>) {
        let (tick_tx, tick_rx) = crossbeam_channel::bounded(1);
        (
            Arc::new(Shared {
                listeners: Vec::new(),
                buffer_capacity: 4096,
                tick_tx,
                shutdown: AtomicBool::new(false),
                triggers: Vec::new(),
            }),
            tick_rx,
        )
    }
}

/// Requests a graceful stop of a running server, from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
    ring: Option<Arc<DispatchRing<Conn>>>,
}

impl ShutdownHandle {
    /// Unwind all loops, as if a callback had returned `Action::Shutdown`.
    pub fn shutdown(&self) {
        self.shared.signal_shutdown();
        if let Some(ring) = &self.ring {
            ring.close();
        }
    }
}

/// A launched server: the loops plus their supporting threads.
pub struct Server {
    shared: Arc<Shared>,
    ring: Option<Arc<DispatchRing<Conn>>>,
    loops: Vec<JoinHandle<Result<(), Error>>>,
    aux: Vec<JoinHandle<()>>,
}

impl Server {
    /// Handle for stopping the server from outside its callbacks.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: self.shared.clone(),
            ring: self.ring.clone(),
        }
    }

    /// Block until every loop has exited, then reap the supporting threads.
    /// Returns the first loop failure, if any.
    pub fn wait(self) -> Result<(), Error> {
        let mut first_err = None;
        for handle in self.loops {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(_) => {
                    if first_err.is_none() {
                        first_err = Some(Error::Io(io::Error::other("loop thread panicked")));
                    }
                }
            }
        }

        // All loops are gone; release the consumers and the ticker, then
        // reclaim connections stranded in the dispatcher.
        self.shared.signal_shutdown();
        if let Some(ring) = &self.ring {
            ring.close();
        }
        for handle in self.aux {
            let _ = handle.join();
        }
        if let Some(ring) = &self.ring {
            // Dropping a stranded connection closes its descriptor.
            ring.drain_remaining(drop);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Start the server threads and return immediately.
///
/// With `num_loops > 1` this spawns one main-reactor thread owning the
/// listeners, N event-loop threads, and N dispatch consumers; a single-loop
/// configuration runs everything on one thread. A ticker thread is added
/// when the handler opts in via [`EventHandler::TICK`].
pub fn launch<H: EventHandler>(listeners: Vec<Listener>, config: Config) -> Result<Server, Error> {
    let num_loops = if config.num_loops == 0 {
        sys::num_cpus()
    } else {
        config.num_loops
    };
    let dispatched = num_loops > 1;

    let mut pollers = Vec::with_capacity(num_loops);
    let mut triggers = Vec::with_capacity(num_loops + 1);
    for _ in 0..num_loops {
        let poller = Poller::new()?;
        triggers.push(poller.trigger_handle());
        pollers.push(poller);
    }
    let main_poller = if dispatched {
        let poller = Poller::new()?;
        triggers.push(poller.trigger_handle());
        Some(poller)
    } else {
        None
    };

    // The acceptor loop owns the listening descriptors; in single-loop mode
    // that is loop 0 itself. Registration failures are fatal before any
    // thread starts.
    {
        let acceptor = main_poller.as_ref().unwrap_or(&pollers[0]);
        for listener in &listeners {
            acceptor.add_read(listener.raw_fd())?;
        }
    }

    let (tick_tx, tick_rx) = crossbeam_channel::bounded(1);
    let shared = Arc::new(Shared {
        listeners,
        buffer_capacity: config.buffer_capacity,
        tick_tx,
        shutdown: AtomicBool::new(false),
        triggers: triggers.clone(),
    });
    let ring = dispatched.then(|| Arc::new(DispatchRing::<Conn>::new(num_loops)));

    let mut loops = Vec::with_capacity(num_loops + 1);
    let mut aux = Vec::new();

    for (idx, poller) in pollers.into_iter().enumerate() {
        let accept_mode = if dispatched {
            AcceptMode::Disabled
        } else {
            AcceptMode::Direct
        };
        let shared = shared.clone();
        let trigger = triggers[idx].clone();
        let read_buffer_size = config.read_buffer_size;
        loops.push(
            thread::Builder::new()
                .name(format!("loop-{idx}"))
                .spawn(move || {
                    let core = LoopCore::new(
                        idx,
                        H::create_for_loop(idx),
                        shared.clone(),
                        accept_mode,
                        trigger,
                        read_buffer_size,
                    );
                    let res = EventLoop { poller, core }.run();
                    if let Err(e) = &res {
                        tracing::warn!(loop_idx = idx, error = %e, "loop exited with error");
                    }
                    shared.signal_shutdown();
                    res
                })?,
        );
    }

    if let Some(poller) = main_poller {
        let ring_arc = ring.clone().expect("dispatched mode always has a ring");
        let shared = shared.clone();
        let trigger = triggers[num_loops].clone();
        let read_buffer_size = config.read_buffer_size;
        loops.push(
            thread::Builder::new()
                .name("main-reactor".to_string())
                .spawn(move || {
                    let core = LoopCore::new(
                        num_loops,
                        H::create_for_loop(num_loops),
                        shared.clone(),
                        AcceptMode::Publish {
                            ring: ring_arc.clone(),
                            sequence: 0,
                        },
                        trigger,
                        read_buffer_size,
                    );
                    let res = EventLoop { poller, core }.run();
                    if let Err(e) = &res {
                        tracing::warn!(error = %e, "main reactor exited with error");
                    }
                    // Let in-flight commits drain before the dispatcher goes.
                    thread::sleep(DISPATCH_GRACE);
                    shared.signal_shutdown();
                    ring_arc.close();
                    res
                })?,
        );
    }

    if let Some(ring) = &ring {
        for idx in 0..num_loops {
            let ring = ring.clone();
            let trigger = triggers[idx].clone();
            let buffer_capacity = config.buffer_capacity;
            aux.push(
                thread::Builder::new()
                    .name(format!("dispatch-{idx}"))
                    .spawn(move || {
                        run_consumer(&ring, idx, num_loops, buffer_capacity, &trigger)
                    })?,
            );
        }
    }

    if H::TICK {
        let shared = shared.clone();
        let trigger = triggers[0].clone();
        aux.push(
            thread::Builder::new()
                .name("ticker".to_string())
                .spawn(move || run_ticker(&shared, &trigger, &tick_rx))?,
        );
    }

    Ok(Server {
        shared,
        ring,
        loops,
        aux,
    })
}

/// Run the server to completion on the calling thread.
pub fn serve<H: EventHandler>(listeners: Vec<Listener>, config: Config) -> Result<(), Error> {
    launch::<H>(listeners, config)?.wait()
}

/// Dispatch-ring consumer for one loop: observe every committed sequence in
/// order, claim those owned by round-robin, and hand them to the loop via a
/// Register note so poller registration happens on the loop's own thread.
fn run_consumer(
    ring: &DispatchRing<Conn>,
    idx: usize,
    num_loops: usize,
    buffer_capacity: usize,
    trigger: &Trigger,
) {
    let mut next: i64 = 0;
    'outer: while let Some(published) = ring.wait_published(next) {
        for seq in next..=published {
            if (seq % num_loops as i64) as usize != idx {
                continue;
            }
            let Some(mut conn) = ring.take(seq) else {
                continue;
            };
            conn.init_buffers(buffer_capacity);
            conn.loop_idx = idx;
            conn.trigger = Some(trigger.clone());
            let fd = conn.fd;
            tracing::debug!(seq, fd, loop_idx = idx, "claimed dispatched connection");
            if trigger
                .trigger(Note::Register {
                    fd,
                    conn: Box::new(conn),
                })
                .is_err()
            {
                // The loop is gone; the dropped note reclaims the socket.
                break 'outer;
            }
        }
        ring.advance(idx, published);
        next = published + 1;
    }
}

/// Paces the tick callback: trigger loop 0, wait for the delay it publishes,
/// sleep, repeat. The loop itself runs the callback; this thread only paces.
fn run_ticker(shared: &Shared, trigger: &Trigger, tick_rx: &Receiver<Duration>) {
    loop {
        if shared.is_shutdown() || trigger.trigger(Note::Tick).is_err() {
            return;
        }
        let delay = loop {
            match tick_rx.recv_timeout(TICKER_POLL) {
                Ok(delay) => break delay,
                Err(RecvTimeoutError::Timeout) => {
                    if shared.is_shutdown() {
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        };
        let deadline = Instant::now() + delay;
        loop {
            if shared.is_shutdown() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(TICKER_POLL));
        }
    }
}
