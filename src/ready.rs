use std::{fmt, ops};

/// A set of readiness events: readable, writable, error, hup.
///
/// Grounded on queen-io's `src/ready.rs` (bit-packed `usize`,
/// `BitOr`/`contains` ops), generalized with the `hup` bit that
/// module lacks but `sys/epoll.rs`'s event decode already needs
/// (`EPOLLRDHUP | EPOLLHUP`), matching spec.md §4.1's "hangup is
/// reported" dispatch case.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ready(usize);

const READABLE: usize = 0b0001;
const WRITABLE: usize = 0b0010;
const ERROR: usize = 0b0100;
const HUP: usize = 0b1000;
const READY_ALL: usize = READABLE | WRITABLE | ERROR | HUP;

impl Ready {
    #[inline]
    pub fn empty() -> Ready {
        Ready(0)
    }

    #[inline]
    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    #[inline]
    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    #[inline]
    pub fn hup() -> Ready {
        Ready(HUP)
    }

    #[inline]
    pub fn all() -> Ready {
        Ready(READY_ALL)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self == Ready::empty()
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(Ready::readable())
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(Ready::writable())
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.contains(Ready::error())
    }

    #[inline]
    pub fn is_hup(self) -> bool {
        self.contains(Ready::hup())
    }

    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut flag = |name: &str, set: bool, f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if set {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
            Ok(())
        };
        write!(f, "Ready(")?;
        flag("READABLE", self.is_readable(), f)?;
        flag("WRITABLE", self.is_writable(), f)?;
        flag("ERROR", self.is_error(), f)?;
        flag("HUP", self.is_hup(), f)?;
        write!(f, ")")
    }
}

#[cfg(test)]
mod test {
    use super::Ready;

    #[test]
    fn union_and_contains() {
        let r = Ready::readable() | Ready::writable();
        assert!(r.is_readable());
        assert!(r.is_writable());
        assert!(!r.is_error());
    }

    #[test]
    fn remove() {
        let mut r = Ready::all();
        r.remove(Ready::writable());
        assert!(r.is_readable());
        assert!(!r.is_writable());
    }
}
