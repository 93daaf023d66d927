use std::io;
use std::os::unix::io::RawFd;
use std::thread::{self, ThreadId};

use log::warn;

use crate::ready::Ready;
use crate::token::Token;

/// A channel's registration status in its loop's poller.
///
/// Mirrors `EPollPoller.cc`'s `kNew`/`kAdded`/`kDeleted` constants
/// (spec.md §3, §4.2).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelIndex {
    /// Never registered with the poller.
    New,
    /// Currently has a live `epoll_ctl` registration.
    Added,
    /// Was registered, then removed from the kernel, but the map/
    /// bookkeeping slot may still be reused without a fresh insert.
    Deleted,
}

/// Binds a file descriptor to an interest set and drives its
/// `epoll_ctl` registration.
///
/// Grounded on `examples/original_source/Channel.h`/`Channel.cc` for
/// the interest/index bookkeeping, and on
/// `examples/danclive-queen-io/src/sys/epoll.rs` for the `epoll_ctl`
/// encoding (`ioevent_to_epoll`) this module inlines.
///
/// Unlike the C++ reference, a `Channel` here does not hold a raw
/// back-pointer to its owning `EventLoop` (`loop_` in `Channel.h`) —
/// that would be a self-referential borrow Rust can't express
/// safely. Instead it carries a `Copy` of the owning loop's raw
/// `epoll` file descriptor, which is enough to issue `epoll_ctl`
/// directly: the kernel object outlives every `Channel` registered
/// against it (spec.md §3's "a channel's lifetime is strictly shorter
/// than its owning loop's" invariant), so the copy never dangles in
/// practice. The four per-event callbacks and the weak "tie" from
/// spec.md §3/§4.1 are *not* stored on `Channel` itself; see
/// `crate::poller::Dispatch` and its doc comment for where that
/// dispatch-ordering logic and the tie/upgrade-or-skip guard actually
/// live in this crate.
pub struct Channel {
    epoll_fd: RawFd,
    fd: RawFd,
    token: Token,
    interest: Ready,
    revents: Ready,
    index: ChannelIndex,
    // Stamped lazily on first `update`/`remove` rather than in `new`:
    // a `Connection`'s `Channel` is constructed on whichever thread
    // accepted the socket (the base loop) but only ever enabled/
    // updated from `io_loop`'s thread once `connect_established` runs
    // there, so capturing it at construction would record the wrong
    // thread and trip the assertion below on the very first call.
    owner_thread: Option<ThreadId>,
}

impl Channel {
    pub(crate) fn new(epoll_fd: RawFd, fd: RawFd, token: Token) -> Channel {
        Channel {
            epoll_fd,
            fd,
            token,
            interest: Ready::empty(),
            revents: Ready::empty(),
            index: ChannelIndex::New,
            owner_thread: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn interest(&self) -> Ready {
        self.interest
    }

    pub fn revents(&self) -> Ready {
        self.revents
    }

    pub(crate) fn set_revents(&mut self, revents: Ready) {
        self.revents = revents;
    }

    pub fn index(&self) -> ChannelIndex {
        self.index
    }

    pub fn is_none_event(&self) -> bool {
        self.interest.is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.interest.is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest.is_writable()
    }

    pub fn enable_reading(&mut self) -> io::Result<()> {
        self.interest.insert(Ready::readable());
        self.update()
    }

    pub fn disable_reading(&mut self) -> io::Result<()> {
        self.interest.remove(Ready::readable());
        self.update()
    }

    pub fn enable_writing(&mut self) -> io::Result<()> {
        self.interest.insert(Ready::writable());
        self.update()
    }

    pub fn disable_writing(&mut self) -> io::Result<()> {
        self.interest.remove(Ready::writable());
        self.update()
    }

    pub fn disable_all(&mut self) -> io::Result<()> {
        self.interest = Ready::empty();
        self.update()
    }

    /// Request the poller to reconcile the kernel registration with
    /// `self.interest`, following the exact New/Added/Deleted
    /// transition table of `EPollPoller::updateChannel`.
    fn update(&mut self) -> io::Result<()> {
        self.check_owner_thread();

        match self.index {
            ChannelIndex::New | ChannelIndex::Deleted => {
                self.ctl(libc::EPOLL_CTL_ADD)?;
                self.index = ChannelIndex::Added;
            }
            ChannelIndex::Added => {
                if self.is_none_event() {
                    self.ctl(libc::EPOLL_CTL_DEL)?;
                    self.index = ChannelIndex::Deleted;
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD)?;
                }
            }
        }
        Ok(())
    }

    /// Remove the channel from the poller entirely (`EPollPoller::removeChannel`).
    pub fn remove(&mut self) -> io::Result<()> {
        self.check_owner_thread();

        if self.index == ChannelIndex::Added {
            self.ctl(libc::EPOLL_CTL_DEL)?;
        }
        self.index = ChannelIndex::New;
        Ok(())
    }

    /// Stamps `owner_thread` on first use, then asserts every later
    /// `update`/`remove` call stays on that same thread (spec.md §3's
    /// "a channel's lifetime is strictly shorter than its owning
    /// loop's" — by extension, all its registration traffic comes
    /// from one thread for its whole life, just not necessarily the
    /// thread that called `Channel::new`).
    fn check_owner_thread(&mut self) {
        let current = thread::current().id();
        match self.owner_thread {
            None => self.owner_thread = Some(current),
            Some(owner) => debug_assert_eq!(
                current, owner,
                "Channel::update/remove called off its owning loop's thread"
            ),
        }
    }

    fn ctl(&self, op: libc::c_int) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: crate::poller::epoll::encode_interest(self.interest),
            u64: usize::from(self.token) as u64,
        };

        let res = unsafe { libc::epoll_ctl(self.epoll_fd, op, self.fd, &mut event) };
        if res == -1 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                // Non-fatal: the fd may already be closed (spec.md §4.2, §7).
                warn!("epoll_ctl(DEL) fd={} failed: {err}", self.fd);
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("token", &self.token)
            .field("interest", &self.interest)
            .field("revents", &self.revents)
            .field("index", &self.index)
            .finish()
    }
}
