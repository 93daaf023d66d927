//! Per-socket state machine: read/write buffers, the four user
//! callbacks, and shutdown/close choreography.
//!
//! `examples/original_source/`'s retrieval didn't keep
//! `TcpConnection.h`/`.cc` (only `TcpServer.h`/`.cc` reference them),
//! so this module is grounded directly on spec.md §4.7's state table
//! and close/send-path prose, cross-checked against `Channel.cc`'s
//! callback-dispatch contract (hup-without-readable, error, readable,
//! writable, in that order) it must reproduce in its own `Dispatch`
//! impl. Non-blocking read/write wrapping follows
//! `examples/danclive-queen-io/src/net/tcp.rs`'s `std::net`-wrapping
//! idiom.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{error, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::poller::{Dispatch, Registration};
use crate::ready::Ready;
use crate::socket;
use crate::token::Token;

/// Default high-water mark: once the output buffer crosses this many
/// bytes, `high_water_cb` fires once per crossing (spec.md §6).
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub type ConnectionCallback = Box<dyn Fn(&Connection) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(&Connection, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Box<dyn Fn(&Connection) + Send + Sync>;
pub type HighWaterCallback = Box<dyn Fn(&Connection, usize) + Send + Sync>;
pub type CloseCallback = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// One accepted TCP socket, bound to a single sub loop for its entire
/// lifetime (spec.md §3, §4.7).
pub struct Connection {
    name: String,
    io_loop: Arc<EventLoop>,
    socket: TcpStream,
    token: Token,
    channel: RefCell<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: Cell<State>,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    high_water_mark: usize,
    // A weak tie back to this connection's own `Arc`, so `&self`
    // methods can recover an owned strong reference to post onto the
    // loop's task queue (`connect_destroyed` must outlive the
    // triggering callback's stack frame) without needing the
    // not-yet-stable `self: &Arc<Self>` receiver form.
    self_weak: RefCell<Weak<Connection>>,

    connection_cb: RefCell<Option<ConnectionCallback>>,
    message_cb: RefCell<Option<MessageCallback>>,
    write_complete_cb: RefCell<Option<WriteCompleteCallback>>,
    high_water_cb: RefCell<Option<HighWaterCallback>>,
    close_cb: RefCell<Option<CloseCallback>>,
}

// SAFETY: every `RefCell`/`Cell` field is only ever mutated on
// `io_loop`'s owning thread (`connect_established`, `handle_*`,
// `send_in_loop`, `shutdown_in_loop` all run there; cross-thread
// `send`/`shutdown` post through `EventLoop::run_in_loop` rather than
// touching these fields directly). Sharing `Arc<Connection>` across
// threads is required so a foreign thread can hold a handle and call
// `send`/`shutdown`/the read-only accessors, and so `Server` can move
// it into tasks posted to other loops.
unsafe impl Sync for Connection {}

impl Dispatch for Connection {
    /// Reproduces `Channel::handleEventWithGuard`'s exact order
    /// (spec.md §4.1): hangup-without-readable, then error, then
    /// readable, then writable. The weak-tie upgrade-or-skip guard
    /// (spec.md §8 property 8) already happened one layer up, in
    /// `Registration::Tied::dispatch` — by the time this runs, an
    /// `Arc<Connection>` strong reference is alive for the duration
    /// of the call.
    fn dispatch(self: Arc<Self>, revents: Ready, now: Instant) {
        if revents.is_hup() && !revents.is_readable() {
            self.handle_close();
            return;
        }
        if revents.is_error() {
            self.handle_error();
        }
        if revents.is_readable() {
            self.handle_read(now);
        }
        if revents.is_writable() {
            self.handle_write();
        }
    }
}

impl Connection {
    pub(crate) fn new(
        name: String,
        io_loop: Arc<EventLoop>,
        socket: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<Connection> {
        let fd = socket.as_raw_fd();
        let token = Token(fd as usize);
        let channel = Channel::new(io_loop.epoll_fd(), fd, token);

        if let Err(e) = socket.set_nodelay(true) {
            warn!("Connection '{name}': set_nodelay failed: {e}");
        }

        // Registration is deferred to `connect_established`, which runs
        // on `io_loop`'s own thread: `Connection::new` itself runs on
        // whichever thread accepted the socket (the base loop, per
        // `Server::new_connection`), and `register_dispatch` must only
        // ever touch `io_loop`'s poller from `io_loop`'s thread
        // (spec.md §5; matches muduo's `TcpConnection` registering its
        // channel inside `connectEstablished`, not its constructor).
        Arc::new_cyclic(|weak: &Weak<Connection>| {
            Connection {
                name,
                io_loop,
                socket,
                token,
                channel: RefCell::new(channel),
                local_addr,
                peer_addr,
                state: Cell::new(State::Connecting),
                input: RefCell::new(Buffer::new()),
                output: RefCell::new(Buffer::new()),
                high_water_mark: DEFAULT_HIGH_WATER_MARK,
                self_weak: RefCell::new(weak.clone()),
                connection_cb: RefCell::new(None),
                message_cb: RefCell::new(None),
                write_complete_cb: RefCell::new(None),
                high_water_cb: RefCell::new(None),
                close_cb: RefCell::new(None),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn io_loop(&self) -> &Arc<EventLoop> {
        &self.io_loop
    }

    pub fn is_connected(&self) -> bool {
        self.state.get() == State::Connected
    }

    fn arc(&self) -> Arc<Connection> {
        self.self_weak
            .borrow()
            .upgrade()
            .expect("Connection outlived by its own strong references")
    }

    pub(crate) fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_high_water_callback(&self, cb: HighWaterCallback) {
        *self.high_water_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.borrow_mut() = Some(cb);
    }

    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        socket::set_keepalive(self.socket.as_raw_fd(), on)
    }

    /// `Connecting -> Connected`: register the channel's dispatch on
    /// `io_loop` (deferred here rather than in `new` — see its doc
    /// comment), enable read, invoke the connection callback. Run as
    /// the posted "connectEstablished" task (spec.md §2 data flow,
    /// §4.7).
    pub(crate) fn connect_established(&self) {
        debug_assert!(self.io_loop.is_in_loop_thread());
        debug_assert_eq!(self.state.get(), State::Connecting);

        let dispatch_weak: Weak<dyn Dispatch> = self.self_weak.borrow().clone();
        self.io_loop.register_dispatch(self.token, Registration::Tied(dispatch_weak));

        self.state.set(State::Connected);
        if let Err(e) = self.channel.borrow_mut().enable_reading() {
            error!("Connection '{}': enable_reading failed: {e}", self.name);
        }
        if let Some(cb) = self.connection_cb.borrow().as_ref() {
            cb(self);
        }
    }

    /// `Disconnecting -> Disconnected`: disable all events, remove
    /// the channel. Run as the posted "destroyed" task (spec.md
    /// §4.7).
    ///
    /// muduo's `connectDestroyed` unconditionally fires the user
    /// connection (down) callback; this only skips it when the normal
    /// close path (`handle_close`) already fired it (state already
    /// `Disconnecting`), so a connection torn down directly — e.g.
    /// `Server`'s drop path, or `remove_connection` without a prior
    /// close event — still observes exactly one down callback, per
    /// spec.md §4.7's state table and §8 property 4.
    pub(crate) fn connect_destroyed(&self) {
        debug_assert!(self.io_loop.is_in_loop_thread());
        if self.state.get() == State::Connected {
            self.state.set(State::Disconnecting);
            if let Err(e) = self.channel.borrow_mut().disable_all() {
                error!("Connection '{}': disable_all failed: {e}", self.name);
            }
            if let Some(cb) = self.connection_cb.borrow().as_ref() {
                cb(self);
            }
        }
        self.io_loop.unregister_dispatch(self.token);
        self.state.set(State::Disconnected);
    }

    fn handle_read(&self, now: Instant) {
        let mut socket = &self.socket;
        let result = self.input.borrow_mut().read_from(&mut socket);
        match result {
            Ok(0) => self.handle_close(),
            Ok(_n) => {
                if let Some(cb) = self.message_cb.borrow().as_ref() {
                    let mut input = self.input.borrow_mut();
                    cb(self, &mut input, now);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!("Connection '{}': read error: {e}", self.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        if !self.channel.borrow().is_writing() {
            return;
        }

        let wrote = {
            let mut output = self.output.borrow_mut();
            let pending = output.peek().to_vec();
            if pending.is_empty() {
                Ok(0)
            } else {
                let mut socket = &self.socket;
                match socket.write(&pending) {
                    Ok(n) => {
                        output.retrieve(n);
                        Ok(n)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match wrote {
            Ok(_) => {
                if self.output.borrow().is_empty() {
                    if let Err(e) = self.channel.borrow_mut().disable_writing() {
                        error!("Connection '{}': disable_writing failed: {e}", self.name);
                    }
                    if let Some(cb) = self.write_complete_cb.borrow().as_ref() {
                        cb(self);
                    }
                    if self.state.get() == State::Disconnecting {
                        self.shutdown_write_side();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!("Connection '{}': write error: {e}", self.name);
            }
        }
    }

    fn handle_error(&self) {
        if let Some(e) = self.socket.take_error().ok().flatten() {
            error!("Connection '{}': socket error: {e}", self.name);
        } else {
            error!("Connection '{}': error event with no pending SO_ERROR", self.name);
        }
        self.handle_close();
    }

    /// Close path (spec.md §4.7): disable all events, invoke the
    /// connection callback reporting disconnected, invoke the close
    /// callback (the `Server` uses it to unregister), then post a
    /// `destroyed` task to finalize channel removal.
    fn handle_close(&self) {
        if self.state.get() == State::Disconnected {
            return;
        }
        self.state.set(State::Disconnecting);
        if let Err(e) = self.channel.borrow_mut().disable_all() {
            error!("Connection '{}': disable_all failed: {e}", self.name);
        }

        if let Some(cb) = self.connection_cb.borrow().as_ref() {
            cb(self);
        }

        let conn = self.arc();
        if let Some(cb) = self.close_cb.borrow().as_ref() {
            cb(&conn);
        }

        self.io_loop.queue_in_loop(move || conn.connect_destroyed());
    }

    /// `send(bytes)` (spec.md §4.7). On the owning thread while
    /// Connected: try a direct write; any remainder (or an
    /// already-in-progress write) goes to the output buffer with
    /// write interest enabled, and a high-water crossing fires the
    /// high-water callback. From a foreign thread: posts a task that
    /// does the above on the owning thread.
    pub fn send(&self, data: &[u8]) {
        if self.io_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.arc();
            let owned = data.to_vec();
            self.io_loop.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        if self.state.get() != State::Connected {
            warn!("Connection '{}': send() after disconnect, dropped", self.name);
            return;
        }

        let already_writing = self.channel.borrow().is_writing();
        let mut remaining: &[u8] = data;

        if !already_writing && self.output.borrow().is_empty() {
            let mut socket = &self.socket;
            match socket.write(data) {
                Ok(n) => {
                    remaining = &data[n..];
                    if remaining.is_empty() {
                        if let Some(cb) = self.write_complete_cb.borrow().as_ref() {
                            cb(self);
                        }
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    error!("Connection '{}': direct write error: {e}", self.name);
                    return;
                }
            }
        }

        if remaining.is_empty() {
            return;
        }

        let new_size = {
            let mut output = self.output.borrow_mut();
            output.append(remaining);
            output.readable()
        };

        if let Err(e) = self.channel.borrow_mut().enable_writing() {
            error!("Connection '{}': enable_writing failed: {e}", self.name);
        }

        if new_size >= self.high_water_mark {
            if let Some(cb) = self.high_water_cb.borrow().as_ref() {
                cb(self, new_size);
            }
        }
    }

    /// User-initiated shutdown (spec.md §4.7): shuts the write side
    /// now if nothing is in flight, else defers until the output
    /// buffer drains (`handle_write` checks `Disconnecting` state).
    pub fn shutdown(&self) {
        if self.io_loop.is_in_loop_thread() {
            self.shutdown_in_loop();
        } else {
            let conn = self.arc();
            self.io_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        if self.state.get() != State::Connected {
            return;
        }
        self.state.set(State::Disconnecting);
        // If output is still draining, `handle_write` issues the
        // `shutdown(WR)` itself once `Disconnecting` and empty meet
        // (the row above in spec.md's state table); nothing further
        // to track here.
        if !self.channel.borrow().is_writing() {
            self.shutdown_write_side();
        }
    }

    fn shutdown_write_side(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Write) {
            warn!("Connection '{}': shutdown(WR) failed: {e}", self.name);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state.get())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn accept_pair() -> (TcpStream, TcpStream, SocketAddr, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();
        let local = server.local_addr().unwrap();
        (server, client, local, peer)
    }

    #[test]
    fn echo_round_trip_via_loop() {
        let event_loop = EventLoop::new("conn-test").unwrap();
        let (server_sock, mut client, local, peer) = accept_pair();

        let conn = Connection::new(
            "echo-test-conn".into(),
            event_loop.clone(),
            server_sock,
            local,
            peer,
        );

        let up = Arc::new(AtomicUsize::new(0));
        let down = Arc::new(AtomicUsize::new(0));
        let up2 = up.clone();
        let down2 = down.clone();
        conn.set_connection_callback(Box::new(move |c| {
            if c.is_connected() {
                up2.fetch_add(1, Ordering::SeqCst);
            } else {
                down2.fetch_add(1, Ordering::SeqCst);
            }
        }));
        conn.set_message_callback(Box::new(|c, buf, _ts| {
            let echoed = buf.retrieve_all();
            c.send(&echoed);
            c.shutdown();
        }));

        conn.connect_established();
        assert_eq!(up.load(Ordering::SeqCst), 1);

        client.write_all(b"hello").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut got = Vec::new();
        let mut buf = [0u8; 64];
        while Instant::now() < deadline {
            conn.handle_read(Instant::now());
            conn.handle_write();
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("client read error: {e}"),
            }
        }
        assert_eq!(got, b"hello");
    }

    #[test]
    fn direct_destroy_from_connected_fires_down_callback_once() {
        let event_loop = EventLoop::new("direct-destroy-test").unwrap();
        let (server_sock, _client, local, peer) = accept_pair();

        let conn = Connection::new(
            "direct-destroy-conn".into(),
            event_loop.clone(),
            server_sock,
            local,
            peer,
        );

        let down = Arc::new(AtomicUsize::new(0));
        let down2 = down.clone();
        conn.set_connection_callback(Box::new(move |c| {
            if !c.is_connected() {
                down2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        conn.connect_established();
        // Torn down directly, bypassing `handle_close` (e.g. Server's
        // drop path) — the down callback must still fire exactly once.
        conn.connect_destroyed();
        assert_eq!(down.load(Ordering::SeqCst), 1);

        // A second `connect_destroyed` (state already `Disconnected`)
        // must not double-invoke it.
        conn.connect_destroyed();
        assert_eq!(down.load(Ordering::SeqCst), 1);
    }
}
