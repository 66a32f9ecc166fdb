//! riptide - event-driven TCP/UDP server core for Unix.
//!
//! The crate multiplexes many connections across a pool of event loops, each
//! owning one kernel readiness poller (epoll on Linux, kqueue on the BSDs).
//! User code supplies callbacks through [`EventHandler`]; the core owns all
//! sockets, buffers and scheduling.
//!
//! # Architecture
//!
//! - With `num_loops > 1`, a dedicated **main reactor** thread owns the
//!   listening sockets. Accepted connections are published onto a
//!   single-producer/multi-consumer ring and claimed round-robin by one
//!   consumer per loop, which hands them to the owning loop through its
//!   trigger channel. All mutation of a loop's connection table happens on
//!   that loop's thread.
//! - With a single loop, that loop is its own acceptor and the dispatcher is
//!   skipped entirely.
//! - Datagram listeners are serviced inline on the accepting loop: each
//!   datagram becomes an ephemeral connection fed to `react`, and the reply
//!   goes straight back to the source address.
//!
//! # Quick start
//!
//! ```no_run
//! use riptide::{Action, Config, Conn, EventHandler, Listener};
//! use bytes::Bytes;
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn create_for_loop(_index: usize) -> Self {
//!         Echo
//!     }
//!
//!     fn react(&mut self, conn: &mut Conn) -> (Option<Bytes>, Action) {
//!         (Some(conn.take_inbound()), Action::None)
//!     }
//! }
//!
//! fn main() -> Result<(), riptide::Error> {
//!     let listener = Listener::from_tcp(std::net::TcpListener::bind("127.0.0.1:7000")?)?;
//!     riptide::serve::<Echo>(vec![listener], Config::default())
//! }
//! ```

#![cfg(unix)]

mod buffer;
mod conn;
mod error;
mod eventloop;
mod events;
mod listener;
mod poller;
mod ring;
mod server;
mod sys;

pub use buffer::Buffer;
pub use conn::{Conn, Detached, Wake};
pub use error::Error;
pub use events::{Action, EventHandler, Opts};
pub use listener::{Listener, Transport};
pub use server::{Config, Server, ShutdownHandle, launch, serve};
