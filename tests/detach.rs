//! Descriptor handover: react consumes a prefix, detaches, and user code
//! reads the rest from the detached handle in blocking mode.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use riptide::{Action, Config, Conn, Detached, EventHandler, Listener};

static DETACHED: Mutex<Option<Detached>> = Mutex::new(None);
static CLOSED: AtomicUsize = AtomicUsize::new(0);

struct DetachAfterThree;

impl EventHandler for DetachAfterThree {
    fn create_for_loop(_index: usize) -> Self {
        DetachAfterThree
    }

    fn react(&mut self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        if conn.inbound().len() < 6 {
            return (None, Action::None);
        }
        conn.consume(3);
        (None, Action::Detach)
    }

    fn on_detached(&mut self, _conn: &mut Conn, detached: Detached) -> Option<Action> {
        *DETACHED.lock().unwrap() = Some(detached);
        Some(Action::None)
    }

    fn on_closed(&mut self, _conn: &mut Conn, _err: Option<&std::io::Error>) -> Action {
        CLOSED.fetch_add(1, Ordering::SeqCst);
        Action::None
    }
}

#[test]
fn detach_hands_over_unconsumed_bytes_and_descriptor() {
    let listener =
        Listener::from_tcp(std::net::TcpListener::bind("127.0.0.1:0").unwrap()).unwrap();
    let addr = listener.addr();

    let config = Config {
        num_loops: 1,
        ..Config::default()
    };
    let server = riptide::launch::<DetachAfterThree>(vec![listener], config).unwrap();
    let handle = server.shutdown_handle();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"abcdef").unwrap();

    let start = Instant::now();
    let mut detached = loop {
        if let Some(detached) = DETACHED.lock().unwrap().take() {
            break detached;
        }
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "timed out waiting for detach"
        );
        thread::sleep(Duration::from_millis(10));
    };

    // The bytes react did not consume come out of the handle first.
    assert_eq!(detached.pending(), b"def");
    let mut buf = [0u8; 8];
    let n = detached.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"def");

    // The descriptor itself is live and blocking: fresh bytes flow through.
    stream.write_all(b"ghi").unwrap();
    let n = detached.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ghi");

    // And writable from user code.
    detached.write_all(b"ok").unwrap();
    let mut reply = [0u8; 2];
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ok");

    // Detach is an ownership transfer, not a close.
    assert_eq!(CLOSED.load(Ordering::SeqCst), 0);

    handle.shutdown();
    server.wait().unwrap();
    assert_eq!(CLOSED.load(Ordering::SeqCst), 0);
}
