//! The top-level orchestrator: listening socket, sub-loop pool, and
//! the live-connection registry.
//!
//! Grounded on `examples/original_source/TcpServer.h`/`TcpServer.cc`
//! directly: idempotent `start()`, `newConnection`'s name/io_loop/
//! local-addr resolution sequence, and `removeConnectionInLoop`'s
//! base-loop-only map access plus posted `connectDestroyed`.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{info, warn};

use crate::acceptor::Acceptor;
use crate::connection::Connection;
use crate::event_loop::EventLoop;
use crate::socket;
use crate::thread_pool::LoopThreadPool;

/// The reference's `TcpServer::Option { kNoReusePort, kReusePort }`
/// (spec.md §3 supplemented feature), carried as a struct so it can
/// grow without breaking `Server::new`'s signature.
#[derive(Copy, Clone, Debug, Default)]
pub struct ServerOptions {
    pub reuse_port: bool,
}

type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync + 'static>;

/// Owns the base loop's acceptor, the sub-loop pool, and every live
/// `Connection`, keyed by name (spec.md §4.8).
///
/// `connections` is a `Mutex<HashMap<..>>` rather than a bare
/// `RefCell` even though spec.md §5 says it's "accessed only on the
/// base loop's thread": `Acceptor::new_connection_cb` runs on the base
/// loop (satisfying that invariant), but `remove_connection` is
/// *posted to* the base loop from whichever sub-loop detected the
/// close, and Rust has no way to assert "this closure, though it may
/// be constructed on another thread, will only ever execute on the
/// base loop" well enough to let a non-`Send` `RefCell` field exist on
/// a type whose callbacks must be `Send` to be boxed into a task. The
/// mutex is never contended in practice: every access happens from
/// inside a task already running on the base loop.
pub struct Server {
    name: String,
    base_loop: Arc<EventLoop>,
    acceptor: Arc<Acceptor>,
    pool: Mutex<LoopThreadPool>,
    started: AtomicBool,
    next_conn_id: AtomicUsize,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    // A weak tie back to this server's own `Arc`, recovered with
    // `arc()` whenever a method needs to move an owned strong
    // reference into a task or callback closure (the same pattern
    // `Connection::self_weak` uses, for the same reason: stable Rust
    // has no `self: &Arc<Self>` receiver to lean on instead).
    self_weak: Mutex<Weak<Server>>,

    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
    connection_cb: Mutex<Option<Arc<dyn Fn(&Connection) + Send + Sync>>>,
    message_cb: Mutex<Option<Arc<dyn Fn(&Connection, &mut crate::buffer::Buffer, std::time::Instant) + Send + Sync>>>,
    write_complete_cb: Mutex<Option<Arc<dyn Fn(&Connection) + Send + Sync>>>,
    high_water_cb: Mutex<Option<Arc<dyn Fn(&Connection, usize) + Send + Sync>>>,
}

impl Server {
    /// Binds the listening socket on `base_loop` and wires the
    /// acceptor's new-connection callback back into `new_connection`.
    /// Does not start listening yet — call `start()`.
    pub fn new(
        base_loop: Arc<EventLoop>,
        name: impl Into<String>,
        addr: SocketAddr,
        options: ServerOptions,
    ) -> io::Result<Arc<Server>> {
        let name = name.into();
        let acceptor = Acceptor::new(base_loop.clone(), addr, options.reuse_port)?;
        let pool = LoopThreadPool::new(base_loop.clone(), format!("{name}-pool"));

        let server = Arc::new_cyclic(|weak: &Weak<Server>| Server {
            name,
            base_loop,
            acceptor,
            pool: Mutex::new(pool),
            started: AtomicBool::new(false),
            next_conn_id: AtomicUsize::new(1),
            connections: Mutex::new(HashMap::new()),
            self_weak: Mutex::new(weak.clone()),
            thread_init_cb: Mutex::new(None),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&server);
        server.acceptor.set_new_connection_callback(move |stream, peer| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(stream, peer);
            }
        });

        Ok(server)
    }

    fn arc(&self) -> Arc<Server> {
        self.self_weak
            .lock()
            .unwrap()
            .upgrade()
            .expect("Server outlived by its own strong references")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The listening socket's bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Must be called before `start()` (spec.md §4.8).
    pub fn set_thread_num(&self, n: usize) {
        self.pool.lock().unwrap().set_thread_num(n);
    }

    pub fn set_thread_init_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<EventLoop>) + Send + Sync + 'static,
    {
        *self.thread_init_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        *self.connection_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&Connection, &mut crate::buffer::Buffer, std::time::Instant) + Send + Sync + 'static,
    {
        *self.message_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        *self.write_complete_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_high_water_callback<F>(&self, cb: F)
    where
        F: Fn(&Connection, usize) + Send + Sync + 'static,
    {
        *self.high_water_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Idempotent: the first call starts the sub-loop pool and enqueues
    /// `acceptor.listen()` on the base loop; later calls are no-ops
    /// (spec.md §4.8).
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Server '{}' starting", self.name);

        let init_cb = self.thread_init_cb.lock().unwrap().take();
        self.pool.lock().unwrap().start(init_cb)?;

        let acceptor = self.acceptor.clone();
        self.base_loop.run_in_loop(move || {
            if let Err(e) = acceptor.listen() {
                warn!("Server acceptor failed to start listening: {e}");
            }
        });

        Ok(())
    }

    /// Runs on the base loop (the `Acceptor`'s dispatch already does),
    /// per spec.md §4.8's numbered sequence.
    fn new_connection(&self, stream: TcpStream, peer: SocketAddr) {
        debug_assert!(self.base_loop.is_in_loop_thread());

        let io_loop = self.pool.lock().unwrap().next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-{}#{}", self.name, peer, conn_id);

        let local_addr = match socket::local_addr(stream.as_raw_fd()) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Server '{}': getsockname failed for {name}: {e}", self.name);
                return;
            }
        };

        let conn = Connection::new(name.clone(), io_loop.clone(), stream, local_addr, peer);

        self.connections.lock().unwrap().insert(name.clone(), conn.clone());

        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            conn.set_connection_callback(Box::new(move |c| cb(c)));
        }
        if let Some(cb) = self.message_cb.lock().unwrap().clone() {
            conn.set_message_callback(Box::new(move |c, buf, ts| cb(c, buf, ts)));
        }
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(Box::new(move |c| cb(c)));
        }
        if let Some(cb) = self.high_water_cb.lock().unwrap().clone() {
            conn.set_high_water_callback(Box::new(move |c, n| cb(c, n)));
        }

        let weak_server = self.self_weak.lock().unwrap().clone();
        conn.set_close_callback(Box::new(move |conn| {
            if let Some(server) = weak_server.upgrade() {
                server.remove_connection(conn);
            }
        }));

        let established = conn.clone();
        io_loop.queue_in_loop(move || established.connect_established());
    }

    /// Posts to the base loop (may already be running there, e.g. a
    /// connection on the base loop's own sub-loop slot when the pool
    /// has zero threads), erases from the registry, then posts
    /// `connect_destroyed` onto the connection's owning sub-loop
    /// (spec.md §4.8).
    fn remove_connection(&self, conn: &Arc<Connection>) {
        let server = self.arc();
        let conn = conn.clone();
        self.base_loop.run_in_loop(move || {
            server.remove_connection_in_loop(&conn);
        });
    }

    fn remove_connection_in_loop(&self, conn: &Arc<Connection>) {
        debug_assert!(self.base_loop.is_in_loop_thread());
        self.connections.lock().unwrap().remove(conn.name());

        let io_loop = conn.io_loop().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for Server {
    /// For each remaining connection: take a local strong reference,
    /// drop it from the map, then post `connect_destroyed` onto its
    /// owning sub-loop, preserving per-connection ordering (spec.md
    /// §4.8's destruction sequence).
    fn drop(&mut self) {
        let remaining: Vec<Arc<Connection>> = {
            let mut map = self.connections.lock().unwrap();
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in remaining {
            let io_loop = conn.io_loop().clone();
            io_loop.queue_in_loop(move || conn.connect_destroyed());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{SocketAddrV4, TcpStream as StdStream};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn server_accepts_and_echoes() {
        let base_loop = EventLoop::new("server-base").unwrap();
        let addr = SocketAddr::V4(SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 0));
        let server = Server::new(base_loop.clone(), "echo", addr, ServerOptions::default()).unwrap();
        let bound = server.local_addr().unwrap();

        let connected = Arc::new(AtomicUsize::new(0));
        let c2 = connected.clone();
        server.set_connection_callback(move |conn| {
            if conn.is_connected() {
                c2.fetch_add(1, Ordering::SeqCst);
            }
        });
        server.set_message_callback(|conn, buf, _ts| {
            let data = buf.retrieve_all();
            conn.send(&data);
        });

        server.start().unwrap();

        let runner = {
            let base_loop = base_loop.clone();
            thread::spawn(move || base_loop.run())
        };

        let mut client = StdStream::connect(bound).unwrap();
        use std::io::{Read, Write};
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 16];
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        base_loop.quit();
        runner.join().unwrap();
        assert!(connected.load(Ordering::SeqCst) >= 1);
    }
}
