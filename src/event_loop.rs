//! One event loop per thread: poll, dispatch, drain pending tasks.
//!
//! Grounded on `examples/original_source/EventLoop.h`/`EventLoop.cc`
//! (the thread-local one-loop guard, `wakeupFd_`/`wakeupChannel_`,
//! `runInLoop`/`queueInLoop`, `callingPendingFunctors_`) realized with
//! `crate::poller::EpollPoller` for the multiplexer and
//! `crate::sys::eventfd::EventFd` for the wakeup descriptor, both of
//! which this crate already rewrote from `danclive-queen-io`'s
//! equivalents.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::channel::Channel;
use crate::poller::{Dispatch, EpollPoller, Poller, Registration};
use crate::ready::Ready;
use crate::sys::eventfd::EventFd;
use crate::token::Token;

/// `kPollTimeMs` — bounds pure idleness so a `quit()` racing a
/// just-started poll still terminates in bounded time (spec.md §5).
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

std::thread_local! {
    static CURRENT_LOOP: Cell<bool> = const { Cell::new(false) };
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct WakeupDispatch {
    eventfd: EventFd,
}

impl Dispatch for WakeupDispatch {
    fn dispatch(self: Arc<Self>, _revents: Ready, _now: Instant) {
        if let Err(e) = self.eventfd.drain() {
            error!("EventLoop wakeup read failed: {e}");
        }
    }
}

/// Drives one OS thread: `poll → dispatch → run pending tasks`,
/// forever, until `quit()` is observed.
///
/// Grounded on spec.md §3/§4.3 directly. One `EventLoop` may exist per
/// thread at a time (`CURRENT_LOOP` thread-local, set here, checked in
/// `new`); this is the Rust analogue of the reference's
/// `__thread EventLoop *t_loopInThisThread`.
pub struct EventLoop {
    name: String,
    owner_thread: ThreadId,
    poller: RefCell<EpollPoller>,
    active: RefCell<Vec<(Token, Ready)>>,
    pending_tasks: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    running: AtomicBool,
    quitting: AtomicBool,
    // Kept alive for the loop's whole lifetime; never touched again
    // after construction besides being dropped (disabling+removing
    // its registration) in `Drop`.
    wakeup_channel: RefCell<Channel>,
    wakeup_token: Token,
    wakeup: Arc<WakeupDispatch>,
}

// SAFETY: every mutable field is either behind a Mutex (`pending_tasks`)
// or only ever touched from `owner_thread` (enforced by debug_asserts at
// call sites); sharing `&EventLoop` across threads is required so
// foreign threads can call `run_in_loop`/`queue_in_loop`/`quit`.
unsafe impl Sync for EventLoop {}

impl EventLoop {
    /// Constructs a loop bound to the calling thread. Fails hard
    /// (spec.md §3's "construction fails if another is already bound
    /// to the current thread", §7's fatal-construction-error policy)
    /// rather than returning `Err`, matching `LOG_FATAL` in the
    /// reference: there is no sane recovery from two loops per thread.
    pub fn new(name: impl Into<String>) -> io::Result<Arc<EventLoop>> {
        let already_bound = CURRENT_LOOP.with(|c| c.get());
        if already_bound {
            error!("another EventLoop already exists on this thread");
            panic!("EventLoop::new: another EventLoop exists in this thread");
        }

        let name = name.into();
        let mut poller = EpollPoller::new()?;
        let epoll_fd = poller.raw_fd();

        let eventfd = EventFd::new()?;
        let wakeup_fd = eventfd.as_raw_fd();
        let wakeup_token = Token(wakeup_fd as usize);
        let wakeup = Arc::new(WakeupDispatch { eventfd });

        poller.register(wakeup_token, Registration::Untied(wakeup.clone()));

        let mut wakeup_channel = Channel::new(epoll_fd, wakeup_fd, wakeup_token);
        wakeup_channel.enable_reading()?;

        CURRENT_LOOP.with(|c| c.set(true));
        debug!("EventLoop '{name}' created on {:?}", std::thread::current().id());

        Ok(Arc::new(EventLoop {
            name,
            owner_thread: std::thread::current().id(),
            poller: RefCell::new(poller),
            active: RefCell::new(Vec::new()),
            pending_tasks: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            running: AtomicBool::new(false),
            quitting: AtomicBool::new(false),
            wakeup_channel: RefCell::new(wakeup_channel),
            wakeup_token,
            wakeup,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.owner_thread
    }

    /// The raw `epoll` fd backing this loop's poller. `Channel` needs
    /// a copy of it to issue its own `epoll_ctl` calls directly
    /// (see `crate::channel`'s doc comment on why).
    pub(crate) fn epoll_fd(&self) -> RawFd {
        self.poller.borrow().raw_fd()
    }

    /// Blocks until `quit()` has been observed. Each iteration:
    /// clear `active`, `poll`, dispatch every active channel in
    /// report order, then drain `pending_tasks` (spec.md §4.3).
    pub fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.quitting.store(false, Ordering::SeqCst);
        info!("EventLoop '{}' start looping", self.name);

        while !self.quitting.load(Ordering::SeqCst) {
            self.active.borrow_mut().clear();

            let now = {
                let mut poller = self.poller.borrow_mut();
                let mut active = self.active.borrow_mut();
                match poller.poll(POLL_TIMEOUT, &mut active) {
                    Ok(now) => now,
                    Err(e) => {
                        error!("EventLoop '{}' poll failed: {e}", self.name);
                        Instant::now()
                    }
                }
            };

            let active: Vec<(Token, Ready)> = self.active.borrow().clone();
            {
                // Channel registration additions/removals are always
                // deferred to posted tasks (spec.md §4.7's "destroyed"
                // task), never performed synchronously from inside a
                // callback, so one shared borrow for the whole sweep
                // is safe: nothing re-enters `self.poller` here.
                let poller = self.poller.borrow();
                for (token, revents) in active {
                    poller.dispatch(token, revents, now);
                }
            }

            self.run_pending_tasks();
        }

        self.running.store(false, Ordering::SeqCst);
        info!("EventLoop '{}' stop looping", self.name);
    }

    /// Sets the quit flag; wakes the loop if called from a foreign
    /// thread so a blocked `poll` returns promptly (spec.md §4.3, §8
    /// property/scenario S5).
    pub fn quit(&self) {
        self.quitting.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs `task` inline if called from the owning thread; otherwise
    /// enqueues it and wakes the loop (spec.md §4.3).
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always enqueues. Wakes the loop iff the caller is foreign or
    /// the loop is mid-drain, so a task posted during drain is seen
    /// on the very next iteration instead of waiting a full poll
    /// (spec.md §5).
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut tasks = self.pending_tasks.lock().unwrap();
            tasks.push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    fn run_pending_tasks(&self) {
        let tasks = {
            let mut guard = self.pending_tasks.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        self.calling_pending.store(true, Ordering::SeqCst);
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::SeqCst);
    }

    /// Writes the wakeup descriptor so a blocked `poll` on this
    /// loop's thread returns. Safe to call from any thread.
    pub fn wakeup(&self) {
        if let Err(e) = self.wakeup.eventfd.wakeup() {
            error!("EventLoop '{}' wakeup failed: {e}", self.name);
        }
    }

    /// Registers a channel's dispatcher for poll-time delivery. The
    /// channel's `epoll_ctl` registration itself is the channel's own
    /// responsibility (`Channel::enable_reading` etc.); this only
    /// wires up which `Dispatch` fires for its token. Must be called
    /// from the owning thread (spec.md §5).
    pub(crate) fn register_dispatch(&self, token: Token, dispatch: Registration) {
        debug_assert!(self.is_in_loop_thread());
        self.poller.borrow_mut().register(token, dispatch);
    }

    pub(crate) fn unregister_dispatch(&self, token: Token) {
        debug_assert!(self.is_in_loop_thread());
        self.poller.borrow_mut().unregister(token);
    }

    /// `EventLoop::hasChannel` (spec.md §4.3, §8 property 2): true iff
    /// `token` currently has a live registration in this loop's
    /// poller. Must be called from the owning thread.
    pub(crate) fn has_channel(&self, token: Token) -> bool {
        debug_assert!(self.is_in_loop_thread());
        self.poller.borrow().has(token)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Err(e) = self.wakeup_channel.borrow_mut().disable_all() {
            error!("EventLoop '{}' wakeup channel teardown failed: {e}", self.name);
        }
        self.poller.borrow_mut().unregister(self.wakeup_token);
        CURRENT_LOOP.with(|c| c.set(false));
        debug!("EventLoop '{}' destroyed", self.name);
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.name)
            .field("owner_thread", &self.owner_thread)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn construction_fails_twice_on_same_thread() {
        let _loop1 = EventLoop::new("t1").unwrap();
        let result = std::panic::catch_unwind(|| EventLoop::new("t1-again"));
        assert!(result.is_err() || result.unwrap().is_err());
    }

    #[test]
    fn has_channel_reflects_registration_state() {
        let event_loop = EventLoop::new("has-channel").unwrap();
        let token = Token(999999);
        assert!(!event_loop.has_channel(token));

        struct NoopDispatch;
        impl Dispatch for NoopDispatch {
            fn dispatch(self: Arc<Self>, _revents: Ready, _now: Instant) {}
        }
        event_loop.register_dispatch(token, Registration::Untied(Arc::new(NoopDispatch)));
        assert!(event_loop.has_channel(token));

        event_loop.unregister_dispatch(token);
        assert!(!event_loop.has_channel(token));
    }

    #[test]
    fn construction_succeeds_on_distinct_threads() {
        let handles: Vec<_> = (0..3)
            .map(|i| thread::spawn(move || EventLoop::new(format!("t{i}")).unwrap()))
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn cross_thread_run_in_loop_executes_on_owner() {
        let event_loop = EventLoop::new("owner").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let el = event_loop.clone();
        let c = counter.clone();
        let runner = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            el.run_in_loop(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(50));
            el.quit();
        });

        event_loop.run();
        runner.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
