use std::io::{self, Read, Write};
use std::fs::File;
use std::os::unix::io::{FromRawFd, AsRawFd, IntoRawFd, RawFd};

/// An owned file descriptor, closed on drop via `std::fs::File`.
///
/// Grounded on queen-io's `sys::fd::FileDesc`, trimmed to the subset the
/// wakeup eventfd needs (no `Seek`/`FileExt`).
#[derive(Debug)]
pub(crate) struct FileDesc(File);

impl FileDesc {
    pub(crate) unsafe fn new(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

impl Read for &FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.0).read(buf)
    }
}

impl Write for &FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
