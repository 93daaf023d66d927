/// Opaque identifier a `Channel` carries through the poller.
///
/// Grounded on queen-io's `src/token.rs`, unchanged: a transparent
/// `usize` newtype so `epoll_event.u64` round-trips without a lookup.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    #[inline]
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    #[inline]
    fn from(val: Token) -> usize {
        val.0
    }
}
