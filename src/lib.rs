//! A non-blocking TCP server runtime built on the Reactor pattern,
//! one event loop per thread.
//!
//! An [`EventLoop`] owns a single-threaded `poll -> dispatch -> run
//! pending tasks` cycle; a [`Server`] accepts connections on a base
//! loop and round-robins each accepted [`Connection`] onto a fixed
//! pool of sub loops, so all I/O for a given connection runs on one
//! thread for its whole lifetime.
//!
//! # Example
//!
//! ```no_run
//! use reactor_io::{EventLoop, Server, ServerOptions};
//!
//! let base_loop = EventLoop::new("base").unwrap();
//! let addr = "127.0.0.1:8000".parse().unwrap();
//! let server = Server::new(base_loop.clone(), "echo", addr, ServerOptions::default()).unwrap();
//!
//! server.set_thread_num(4);
//! server.set_connection_callback(|conn| {
//!     log::info!("{}: connected = {}", conn.name(), conn.is_connected());
//! });
//! server.set_message_callback(|conn, buf, _receive_time| {
//!     let data = buf.retrieve_all();
//!     conn.send(&data);
//! });
//!
//! server.start().unwrap();
//! base_loop.run();
//! ```

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod event_loop;
mod poller;
mod ready;
mod server;
mod socket;
mod sys;
mod thread;
mod thread_pool;
mod token;

pub use buffer::Buffer;
pub use connection::Connection;
pub use event_loop::EventLoop;
pub use ready::Ready;
pub use server::{Server, ServerOptions};
pub use token::Token;
