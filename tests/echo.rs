//! End-to-end TCP echo over the dispatched (multi-loop) path.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use riptide::{Action, Config, Conn, EventHandler, Listener, Opts};

static OPENED: AtomicUsize = AtomicUsize::new(0);
static CLOSED: AtomicUsize = AtomicUsize::new(0);
static LOOP_COUNTS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];

struct Echo;

impl EventHandler for Echo {
    fn create_for_loop(_index: usize) -> Self {
        Echo
    }

    fn on_opened(&mut self, conn: &mut Conn) -> (Option<Bytes>, Opts, Action) {
        OPENED.fetch_add(1, Ordering::SeqCst);
        LOOP_COUNTS[conn.loop_index()].fetch_add(1, Ordering::SeqCst);
        (None, Opts::default(), Action::None)
    }

    fn on_closed(&mut self, _conn: &mut Conn, _err: Option<&std::io::Error>) -> Action {
        CLOSED.fetch_add(1, Ordering::SeqCst);
        Action::None
    }

    fn react(&mut self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        (Some(conn.take_inbound()), Action::None)
    }
}

fn wait_for(what: &str, timeout: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < timeout, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn tcp_echo_across_two_loops() {
    let listener =
        Listener::from_tcp(std::net::TcpListener::bind("127.0.0.1:0").unwrap()).unwrap();
    let addr = listener.addr();

    let config = Config {
        num_loops: 2,
        ..Config::default()
    };
    let server = riptide::launch::<Echo>(vec![listener], config).unwrap();
    let handle = server.shutdown_handle();

    // Sequential clients so the dispatch sequence is deterministic.
    for _ in 0..4 {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream.write_all(b"hello").unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    wait_for("all closes", Duration::from_secs(3), || {
        CLOSED.load(Ordering::SeqCst) == 4
    });

    handle.shutdown();
    server.wait().unwrap();

    assert_eq!(OPENED.load(Ordering::SeqCst), 4, "on_opened once per conn");
    assert_eq!(CLOSED.load(Ordering::SeqCst), 4, "on_closed once per conn");

    // Round-robin: 4 accepts over 2 loops land 2 on each.
    assert_eq!(LOOP_COUNTS[0].load(Ordering::SeqCst), 2);
    assert_eq!(LOOP_COUNTS[1].load(Ordering::SeqCst), 2);
}
