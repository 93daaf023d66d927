use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use super::fd::FileDesc;
use super::syscall;

/// The loop's wakeup descriptor: an `eventfd` with counter semantics.
///
/// Grounded on queen-io's `sys::eventfd::EventFd` (same `EFD_CLOEXEC |
/// EFD_NONBLOCK` flags, same 8-byte counter read/write) and on
/// `EventLoop.cc`'s `createEventfd`/`wakeup`/`handleRead`, which is the
/// same mechanism under a different name (`wakeupFd_`).
#[derive(Debug)]
pub(crate) struct EventFd {
    inner: FileDesc,
}

impl EventFd {
    pub(crate) fn new() -> io::Result<EventFd> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(EventFd {
            inner: unsafe { FileDesc::new(fd) },
        })
    }

    /// Writes a single counter increment. A full 8-byte write is
    /// required by the eventfd protocol; anything short of that
    /// (other than `WouldBlock`, meaning the counter is already
    /// saturated) is logged as an error rather than ignored, per
    /// spec.md §4.3 ("partial transfers are logged as errors").
    pub(crate) fn wakeup(&self) -> io::Result<()> {
        let buf = 1u64.to_ne_bytes();
        match (&self.inner).write(&buf) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(n) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("eventfd wakeup: partial write of {n} of 8 bytes"),
            )),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drains the counter back to zero, as the loop's wakeup-channel
    /// read callback does.
    pub(crate) fn drain(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        match (&self.inner).read(&mut buf) {
            Ok(n) if n == buf.len() => Ok(u64::from_ne_bytes(buf)),
            Ok(n) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("eventfd drain: partial read of {n} of 8 bytes"),
            )),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.wakeup().unwrap();
        let count = eventfd.drain().unwrap();
        assert_eq!(1, count);
    }

    #[test]
    fn drain_when_empty_returns_zero() {
        let eventfd = EventFd::new().unwrap();
        assert_eq!(0, eventfd.drain().unwrap());
    }
}
