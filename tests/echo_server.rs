//! End-to-end exercise of the public `Server`/`Connection` API over a
//! real loopback socket, the way `mio`'s own `tests/` directory favors
//! real socket readiness over mocks (SPEC_FULL.md §2).

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reactor_io::{EventLoop, Server, ServerOptions};

fn any_loopback() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
}

#[test]
fn echoes_each_client_independently_across_a_loop_pool() {
    let _ = env_logger::try_init();

    let base_loop = EventLoop::new("base").unwrap();
    let server = Server::new(base_loop.clone(), "echo", any_loopback(), ServerOptions::default())
        .unwrap();
    server.set_thread_num(2);

    let connections = Arc::new(AtomicUsize::new(0));
    let on_connect = connections.clone();
    server.set_connection_callback(move |conn| {
        if conn.is_connected() {
            on_connect.fetch_add(1, Ordering::SeqCst);
        }
    });
    server.set_message_callback(|conn, buf, _receive_time| {
        let data = buf.retrieve_all();
        conn.send(&data);
    });

    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let runner = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };

    let mut clients: Vec<TcpStream> = (0..3)
        .map(|_| {
            let stream = TcpStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            stream
        })
        .collect();

    for (i, client) in clients.iter_mut().enumerate() {
        let payload = format!("hello-{i}");
        client.write_all(payload.as_bytes()).unwrap();
        let mut buf = [0u8; 32];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], payload.as_bytes());
    }

    drop(clients);
    base_loop.quit();
    runner.join().unwrap();

    assert_eq!(connections.load(Ordering::SeqCst), 3);
}
