//! The listening socket and its channel on the base loop.
//!
//! Grounded on `examples/original_source/Acceptor.cc` directly
//! (`createNonblocking`, `setReuseAddr`/`setReusePort`, `bindAddress`,
//! accept-then-dispatch-or-close, `EMFILE` logging), using
//! `crate::socket` for the raw `setsockopt`/`bind` calls `std::net`
//! doesn't expose.

use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::error;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::poller::{Dispatch, Registration};
use crate::ready::Ready;
use crate::socket;
use crate::token::Token;

type NewConnectionCallback = Box<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

/// Owns the non-blocking listening socket and its channel, registered
/// on the base loop (spec.md §3, §4.6).
///
/// Held as `Arc<Acceptor>` (rather than by value on `Server`) purely
/// so its `Channel`'s dispatch can carry a weak tie back to it, the
/// same ownership shape `Connection` uses — `Acceptor` never outlives
/// `Server`'s single strong reference in practice.
pub struct Acceptor {
    base_loop: Arc<EventLoop>,
    listener: TcpListener,
    token: Token,
    channel: RefCell<Channel>,
    listening: RefCell<bool>,
    new_connection_cb: RefCell<Option<NewConnectionCallback>>,
}

// SAFETY: `channel`/`listening`/`new_connection_cb` are only ever
// mutated from `base_loop`'s owning thread (`listen()`, `handle_read`,
// and the dispatch it's driven from all run there). `Arc<Acceptor>`
// needs to cross threads only so `Server` can post `listen()` as a
// task via `EventLoop::run_in_loop`, never so another thread can touch
// these fields directly.
unsafe impl Sync for Acceptor {}

impl Dispatch for Acceptor {
    fn dispatch(self: Arc<Self>, revents: Ready, _now: Instant) {
        if revents.is_readable() {
            self.handle_read();
        }
    }
}

impl Acceptor {
    /// Creates a non-blocking listening socket bound to `addr` (not
    /// yet listening — see `listen()`), and registers its channel's
    /// dispatch on `base_loop`.
    pub fn new(
        base_loop: Arc<EventLoop>,
        addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let listener = socket::bind_nonblocking(addr, reuse_port)?;
        let fd = listener.as_raw_fd();
        let token = Token(fd as usize);
        let channel = Channel::new(base_loop.epoll_fd(), fd, token);
        let base_loop_for_register = base_loop.clone();

        Ok(Arc::new_cyclic(|weak: &Weak<Acceptor>| {
            let dispatch_weak: Weak<dyn Dispatch> = weak.clone();
            base_loop_for_register.register_dispatch(token, Registration::Tied(dispatch_weak));
            Acceptor {
                base_loop,
                listener,
                token,
                channel: RefCell::new(channel),
                listening: RefCell::new(false),
                new_connection_cb: RefCell::new(None),
            }
        }))
    }

    /// The bound address of the listening socket, resolved via the
    /// `std::net` wrapper rather than a fresh `getsockname` call since
    /// `TcpListener::local_addr` already tracks it.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
    {
        *self.new_connection_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Transitions the socket to listening state and enables read on
    /// its channel. Must run on the base loop (spec.md §4.6).
    pub fn listen(&self) -> io::Result<()> {
        debug_assert!(self.base_loop.is_in_loop_thread());
        *self.listening.borrow_mut() = true;
        socket::listen(self.listener.as_raw_fd())?;
        self.channel.borrow_mut().enable_reading()
    }

    fn handle_read(&self) {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    error!("Acceptor: failed to set accepted socket non-blocking: {e}");
                    return;
                }
                let cb = self.new_connection_cb.borrow();
                if let Some(cb) = cb.as_ref() {
                    cb(stream, peer);
                }
                // else: dropping `stream` closes the fd, matching
                // Acceptor::handleRead's "no callback set -> close"
                // branch.
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    return;
                }
                error!("Acceptor accept failed: {e}");
                if e.raw_os_error() == Some(libc::EMFILE) {
                    error!("Acceptor: sockfd reached limit (EMFILE)");
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Err(e) = self.channel.borrow_mut().disable_all() {
            error!("Acceptor channel teardown failed: {e}");
        }
        self.base_loop.unregister_dispatch(self.token);
    }
}
