//! Listening-socket construction: the bits `std::net` doesn't expose
//! (`SO_REUSEPORT`, `SO_KEEPALIVE`) plumbed in via raw `libc` calls,
//! wrapped back into `std::net` types for everything else.
//!
//! Grounded on `examples/original_source/Socket.cc` (`createNonblocking`,
//! `setReuseAddr`/`setReusePort`/`setKeepAlive`, `bindAddress`, `listen`)
//! and on `examples/danclive-queen-io/src/net/tcp.rs`'s own
//! "wrap `std::net`, call `set_nonblocking` after" idiom rather than
//! hand-rolling a full socket type the way `sys/socket.rs` does.

use std::io;
use std::mem;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6, TcpListener};
use std::os::unix::io::{FromRawFd, RawFd};

use crate::sys::syscall;

/// Builds, binds, and (optionally) configures port reuse on a
/// non-blocking IPv4 listening socket, without yet calling `listen(2)`.
///
/// Matches `Acceptor`'s constructor: `createNonblocking` + `setReuseAddr`
/// + `setReusePort` + `bindAddress`, deferring the `listen(2)` call
/// itself to `Acceptor::listen` (spec.md §4.6).
pub(crate) fn bind_nonblocking(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let addr = match addr {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "IPv6 listen addresses are out of scope (spec.md §1 Non-goals)",
            ))
        }
    };

    let fd = syscall!(socket(
        libc::AF_INET,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
    ))?;

    let listener = unsafe { TcpListener::from_raw_fd(fd) };

    set_reuseaddr(fd, true)?;
    if reuse_port {
        set_reuseport(fd, true)?;
    }

    let sockaddr = to_sockaddr_in(addr);
    syscall!(bind(
        fd,
        &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
    ))?;

    Ok(listener)
}

/// `::listen(sockfd_, 1024)` — the backlog muduo's `Socket::listen` hardcodes.
pub(crate) fn listen(fd: RawFd) -> io::Result<()> {
    syscall!(listen(fd, 1024)).map(|_| ())
}

pub(crate) fn set_reuseaddr(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub(crate) fn set_reuseport(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

/// `std::net::TcpStream` has no `set_keepalive`; `SO_KEEPALIVE` is
/// set directly, matching `Socket::setKeepAlive`.
pub(crate) fn set_keepalive(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

fn setsockopt(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = on as libc::c_int;
    syscall!(setsockopt(
        fd,
        level,
        name,
        &val as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

fn to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
        #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
        sin_len: 0,
    }
}

/// `getsockname` for a freshly accepted connection — `TcpServer::newConnection`
/// resolves the local address this way rather than trusting the listener's.
pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        sockaddr_storage_to_addr(&storage)
    }
}

fn sockaddr_storage_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(addr.sin_port))))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unsupported address family (IPv6 out of scope, spec.md §1)",
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn binds_and_reports_local_addr() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let listener = bind_nonblocking(addr, false).unwrap();
        use std::os::unix::io::AsRawFd;
        listen(listener.as_raw_fd()).unwrap();
        let bound = local_addr(listener.as_raw_fd()).unwrap();
        assert_eq!(bound.ip(), addr.ip());
        assert_ne!(bound.port(), 0);
    }
}
