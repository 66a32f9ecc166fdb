//! Ticker pacing and shutdown-from-tick across four loops.

use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use riptide::{Action, Config, Conn, EventHandler, Listener, Opts};

static OPENED: AtomicUsize = AtomicUsize::new(0);
static CLOSED: AtomicUsize = AtomicUsize::new(0);
static TICKS: AtomicUsize = AtomicUsize::new(0);

struct TickShutdown;

impl EventHandler for TickShutdown {
    const TICK: bool = true;

    fn create_for_loop(_index: usize) -> Self {
        TickShutdown
    }

    fn on_opened(&mut self, _conn: &mut Conn) -> (Option<Bytes>, Opts, Action) {
        OPENED.fetch_add(1, Ordering::SeqCst);
        (None, Opts::default(), Action::None)
    }

    fn on_closed(&mut self, _conn: &mut Conn, _err: Option<&std::io::Error>) -> Action {
        CLOSED.fetch_add(1, Ordering::SeqCst);
        Action::None
    }

    fn tick(&mut self) -> (Duration, Action) {
        TICKS.fetch_add(1, Ordering::SeqCst);
        // Keep ticking until a client is connected, then pull the plug.
        if OPENED.load(Ordering::SeqCst) > 0 {
            (Duration::from_millis(10), Action::Shutdown)
        } else {
            (Duration::from_millis(10), Action::None)
        }
    }
}

#[test]
fn shutdown_from_tick_closes_live_connections() {
    let listener =
        Listener::from_tcp(std::net::TcpListener::bind("127.0.0.1:0").unwrap()).unwrap();
    let addr = listener.addr();

    let config = Config {
        num_loops: 4,
        ..Config::default()
    };
    let server = riptide::launch::<TickShutdown>(vec![listener], config).unwrap();

    // One live connection that must see on_closed during the unwind.
    let stream = TcpStream::connect(addr).unwrap();

    let start = Instant::now();
    server.wait().unwrap();
    let elapsed = start.elapsed();

    assert!(TICKS.load(Ordering::SeqCst) >= 1, "tick never fired");
    assert_eq!(OPENED.load(Ordering::SeqCst), 1);
    assert_eq!(
        CLOSED.load(Ordering::SeqCst),
        1,
        "live connection must observe on_closed during shutdown"
    );
    assert!(
        elapsed < Duration::from_secs(5),
        "shutdown took too long: {:?}",
        elapsed
    );

    drop(stream);
}
