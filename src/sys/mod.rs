//! Thin platform glue shared by the channel/poller core.
//!
//! Everything here is unsafe libc plumbing, in the same vein as
//! `crate::channel`'s and `crate::socket`'s own direct `libc` calls —
//! this module just holds the bits (`syscall!`, the eventfd wrapper,
//! the raw-fd `Read`/`Write` wrapper) shared by more than one of them.

/// Run a libc call, turning a `-1` return into the last OS error.
///
/// The same idiom queen-io's own `sys::epoll` and `sys::socket` modules
/// use around `epoll_create1`/`epoll_ctl`/`socket`/`setsockopt`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

mod fd;
pub(crate) mod eventfd;

pub(crate) use fd::FileDesc;
