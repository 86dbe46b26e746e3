use std::{fmt, ops};

/// A set of readiness events.
///
/// `Ready` is a set of operation descriptors indicating what a dispatched
/// event source is ready to perform. For example, `Ready::readable()` means
/// the associated descriptor has data to read.
///
/// `Ready` values can be combined together using the various bitwise
/// operators.
///
/// # Examples
///
/// ```
/// use kestrel_io::Ready;
///
/// let ready = Ready::readable() | Ready::writable();
///
/// assert!(ready.is_readable());
/// assert!(ready.is_writable());
/// ```
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Ready(usize);

const READABLE: usize = 0b0000_1;
const WRITABLE: usize = 0b0001_0;
const ERROR: usize = 0b0010_0;
const HUP: usize = 0b0100_0;
const PRIORITY: usize = 0b1000_0;
const READY_ALL: usize = READABLE | WRITABLE | ERROR | HUP | PRIORITY;

impl Ready {
    /// Returns the empty `Ready` set.
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

    /// Error readiness. Usually means a socket error happened; the exact
    /// error is fetched with `SO_ERROR`.
    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    /// HUP readiness. A HUP (or hang-up) signifies that a stream socket
    /// **peer** closed the connection, or shut down the writing half of
    /// the connection.
    #[inline]
    pub fn hup() -> Ready {
        Ready(HUP)
    }

    /// Priority readiness (out-of-band data pending).
    #[inline]
    pub fn priority() -> Ready {
        Ready(PRIORITY)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Ready::empty()
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Ready::readable())
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Ready::writable())
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Ready(ERROR))
    }

    #[inline]
    pub fn is_hup(&self) -> bool {
        self.contains(Ready(HUP))
    }

    #[inline]
    pub fn is_priority(&self) -> bool {
        self.contains(Ready(PRIORITY))
    }

    /// Adds all readiness represented by `other` into `self`.
    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    /// Removes all options represented by `other` from `self`.
    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    /// Returns true if `self` is a superset of `other`.
    #[inline]
    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }

    /// Returns true if `self` and `other` share any readiness.
    #[inline]
    pub fn intersects(&self, other: Ready) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitXor for Ready {
    type Output = Ready;

    #[inline]
    fn bitxor(self, other: Ready) -> Ready {
        Ready(self.0 ^ other.0)
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl ops::Not for Ready {
    type Output = Ready;

    #[inline]
    fn not(self) -> Ready {
        Ready(!self.0 & READY_ALL)
    }
}

impl From<usize> for Ready {
    fn from(event: usize) -> Ready {
        Ready(event)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready(ERROR), "Error"),
            (Ready(HUP), "Hup"),
            (Ready(PRIORITY), "Priority"),
        ];

        write!(fmt, "Ready {{")?;

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        write!(fmt, "}}")?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Ready;

    #[test]
    fn bit_ops() {
        let ready = Ready::readable() | Ready::writable();
        assert!(ready.contains(Ready::readable()));
        assert!(ready.contains(Ready::writable()));
        assert!(!ready.contains(Ready::hup()));
        assert!(ready.intersects(Ready::readable() | Ready::error()));
        assert!(!ready.intersects(Ready::error() | Ready::priority()));

        let without_read = ready - Ready::readable();
        assert!(!without_read.is_readable());
        assert!(without_read.is_writable());
    }

    #[test]
    fn insert_and_remove() {
        let mut readiness = Ready::empty();
        readiness.insert(Ready::readable());
        assert!(readiness.is_readable());
        readiness.remove(Ready::readable());
        assert!(readiness.is_empty());
    }
}
