use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::{error, trace};

use super::{Dispatch, Poller, Registration};
use crate::ready::Ready;
use crate::sys::{syscall, FileDesc};
use crate::token::Token;

/// Initial size of the active-event buffer handed to `epoll_wait`.
///
/// Matches `EPollPoller.cc`'s `kInitEventListSize`.
const INIT_EVENT_LIST_SIZE: usize = 16;

/// `epoll`-backed implementation of [`Poller`].
///
/// Grounded on `examples/original_source/EPollPoller.cc` for the
/// registration state machine and the never-shrinks active-event
/// buffer, and on `examples/danclive-queen-io/src/sys/epoll.rs` for
/// the raw `epoll_event` encode/decode this module reuses almost
/// verbatim.
pub(crate) struct EpollPoller {
    epoll_fd: FileDesc,
    events: Vec<libc::epoll_event>,
    registry: IndexMap<Token, Registration>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(EpollPoller {
            epoll_fd: unsafe { FileDesc::new(fd) },
            events: vec![unsafe { std::mem::zeroed() }; INIT_EVENT_LIST_SIZE],
            registry: IndexMap::new(),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.epoll_fd.as_raw_fd()
    }
}

impl Poller for EpollPoller {
    fn poll(
        &mut self,
        timeout: Duration,
        active: &mut Vec<(Token, Ready)>,
    ) -> io::Result<Instant> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

        let n = loop {
            let res = unsafe {
                libc::epoll_wait(
                    self.raw_fd(),
                    self.events.as_mut_ptr(),
                    self.events.len() as i32,
                    timeout_ms,
                )
            };
            if res == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("epoll_wait failed: {err}");
                return Err(err);
            }
            break res as usize;
        };

        let now = Instant::now();

        if n > 0 {
            trace!("{n} events happened");
            for ev in &self.events[..n] {
                let token = Token(ev.u64 as usize);
                active.push((token, decode_events(ev.events)));
            }
        }

        if n == self.events.len() {
            // Never shrinks, matches EPollPoller::fillActiveChannels.
            self.events.resize(self.events.len() * 2, unsafe { std::mem::zeroed() });
        }

        Ok(now)
    }

    fn register(&mut self, token: Token, dispatch: Registration) {
        self.registry.insert(token, dispatch);
    }

    fn unregister(&mut self, token: Token) {
        self.registry.swap_remove(&token);
    }

    fn registration(&self, token: Token) -> Option<&Registration> {
        self.registry.get(&token)
    }
}

/// Matches queen-io's `sys::epoll::Events` encode: the set of bits
/// epoll understands as "interest", plus the two always-implicit
/// ones (`EPOLLHUP`, `EPOLLERR`) the kernel reports regardless of
/// what was requested.
pub(crate) fn encode_interest(interest: Ready) -> u32 {
    let mut events = 0u32;
    if interest.is_readable() {
        events |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn decode_events(events: u32) -> Ready {
    let mut ready = Ready::empty();
    let events = events as i32;
    if events & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
        ready.insert(Ready::readable());
    }
    if events & libc::EPOLLOUT != 0 {
        ready.insert(Ready::writable());
    }
    if events & libc::EPOLLERR != 0 {
        ready.insert(Ready::error());
    }
    if events & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0 {
        ready.insert(Ready::hup());
    }
    ready
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_readable_writable() {
        let interest = Ready::readable() | Ready::writable();
        let encoded = encode_interest(interest);
        let decoded = decode_events(encoded);
        assert!(decoded.is_readable());
        assert!(decoded.is_writable());
    }

    #[test]
    fn decodes_hup_variants() {
        let r = decode_events(libc::EPOLLHUP as u32);
        assert!(r.is_hup());
        let r = decode_events(libc::EPOLLRDHUP as u32);
        assert!(r.is_hup());
    }

    #[test]
    fn poller_starts_empty_and_times_out() {
        let mut poller = EpollPoller::new().unwrap();
        let mut active = Vec::new();
        poller
            .poll(Duration::from_millis(10), &mut active)
            .unwrap();
        assert!(active.is_empty());
    }
}
