//! The readiness multiplexer and the active-channel dispatch table.
//!
//! Grounded on `examples/original_source/Poller.h`/`EPollPoller.h`
//! for the abstract contract, and realized with a single concrete
//! implementation (`epoll`), matching the Linux-only scope of
//! spec.md §1.

pub(crate) mod epoll;

use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::ready::Ready;
use crate::token::Token;

pub(crate) use epoll::EpollPoller;

/// What runs when a channel's token comes back from `poll()`.
///
/// `Channel.h`'s four callback fields plus its weak `tie` collapse
/// here into a single trait, implemented once per owner kind
/// (`Acceptor`, the loop's own wakeup descriptor, `Connection`).
/// Each implementation reproduces the exact dispatch order from
/// `Channel::handle_event`/`handleEventWithGuard` (spec.md §4.1):
/// hangup-without-readable, then error, then readable, then
/// writable — it is just spelled out against `&self` instead of
/// against four boxed closures stored on a shared `Channel` object.
pub(crate) trait Dispatch: Send + Sync {
    fn dispatch(self: Arc<Self>, revents: Ready, now: Instant);
}

/// How a token is registered for dispatch.
///
/// `Untied` entries (the acceptor's listening channel, the loop's own
/// wakeup channel) always dispatch: nothing else owns them, so there
/// is no weak tie to fail. `Tied` entries (every `Connection`'s
/// channel) carry only a `Weak` reference — the direct translation of
/// `Channel::tie()` — and silently skip dispatch if the owner has
/// already been dropped (spec.md §4.1, §8 property 8).
pub(crate) enum Registration {
    Untied(Arc<dyn Dispatch>),
    Tied(Weak<dyn Dispatch>),
}

impl Registration {
    fn dispatch(&self, revents: Ready, now: Instant) {
        match self {
            Registration::Untied(owner) => owner.clone().dispatch(revents, now),
            Registration::Tied(owner) => {
                if let Some(owner) = owner.upgrade() {
                    owner.dispatch(revents, now);
                }
            }
        }
    }
}

/// The multiplexer contract a loop drives once per iteration.
///
/// Kept as a trait, per spec.md's REDESIGN FLAGS on polymorphism over
/// concrete multiplexers, even though `EpollPoller` is the only
/// implementation this crate ships (Linux-only scope, spec.md §1
/// Non-goals).
pub(crate) trait Poller {
    /// Blocks up to `timeout`, filling `active` with every
    /// `(Token, Ready)` pair that became ready, and returns the
    /// timestamp used for `on_read` callbacks this iteration.
    fn poll(
        &mut self,
        timeout: std::time::Duration,
        active: &mut Vec<(Token, Ready)>,
    ) -> std::io::Result<Instant>;

    fn register(&mut self, token: Token, dispatch: Registration);
    fn unregister(&mut self, token: Token);

    /// Runs the registered dispatcher for `token`, if any is still
    /// live, with the given readiness bits.
    fn dispatch(&self, token: Token, revents: Ready, now: Instant) {
        if let Some(reg) = self.registration(token) {
            reg.dispatch(revents, now);
        }
    }

    fn registration(&self, token: Token) -> Option<&Registration>;

    /// `EPollPoller::hasChannel` (spec.md §4.2, exercised by testable
    /// property 2): true iff `token` currently has a live registration.
    fn has(&self, token: Token) -> bool {
        self.registration(token).is_some()
    }
}
