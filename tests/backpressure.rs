//! Partial-write backpressure: large responses survive a peer that stops
//! reading, with no loss and no reordering once it drains.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use riptide::{Action, Config, Conn, EventHandler, Listener};

const CHUNK: usize = 1024 * 1024;

/// Answers every received byte `b` with one megabyte of `b`.
struct Amplifier;

impl EventHandler for Amplifier {
    fn create_for_loop(_index: usize) -> Self {
        Amplifier
    }

    fn react(&mut self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        let inbound = conn.take_inbound();
        let mut out = Vec::with_capacity(inbound.len() * CHUNK);
        for &b in inbound.iter() {
            out.extend(std::iter::repeat_n(b, CHUNK));
        }
        (Some(Bytes::from(out)), Action::None)
    }
}

#[test]
fn large_responses_drain_in_order() {
    let listener =
        Listener::from_tcp(std::net::TcpListener::bind("127.0.0.1:0").unwrap()).unwrap();
    let addr = listener.addr();

    let config = Config {
        num_loops: 1,
        ..Config::default()
    };
    let server = riptide::launch::<Amplifier>(vec![listener], config).unwrap();
    let handle = server.shutdown_handle();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // First request; do not read yet, so the server's outbound buffer grows
    // past what the socket accepts and write interest stays registered.
    stream.write_all(b"0").unwrap();
    thread::sleep(Duration::from_millis(300));

    // Second request while the first response is still jammed.
    stream.write_all(b"1").unwrap();

    // Now drain. Both megabytes must arrive complete and in order.
    let mut received = vec![0u8; 2 * CHUNK];
    stream.read_exact(&mut received).unwrap();

    assert!(
        received[..CHUNK].iter().all(|&b| b == b'0'),
        "first response corrupted or reordered"
    );
    assert!(
        received[CHUNK..].iter().all(|&b| b == b'1'),
        "second response corrupted or reordered"
    );

    drop(stream);
    handle.shutdown();
    server.wait().unwrap();
}
