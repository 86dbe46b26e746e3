use std::{fmt, ops};

/// The interest mask an event source registers with the reactor.
///
/// Readiness bits select what the kernel reports for the descriptor;
/// [`Interest::edge`] selects edge-triggered delivery.
///
/// # Examples
///
/// ```
/// use kestrel_io::Interest;
///
/// let interest = Interest::readable() | Interest::edge();
///
/// assert!(interest.is_readable());
/// assert!(interest.is_edge());
/// ```
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Interest(usize);

const READABLE: usize = 0b00000_1;
const WRITABLE: usize = 0b00001_0;
const ERROR: usize = 0b00010_0;
const HUP: usize = 0b00100_0;
const PRIORITY: usize = 0b01000_0;
const EDGE: usize = 0b10000_0;

impl Interest {
    #[inline]
    pub fn empty() -> Interest {
        Interest(0)
    }

    #[inline]
    pub fn readable() -> Interest {
        Interest(READABLE)
    }

    #[inline]
    pub fn writable() -> Interest {
        Interest(WRITABLE)
    }

    /// Errors are always reported by the kernel; the bit exists so a mask
    /// can carry the intent explicitly.
    #[inline]
    pub fn error() -> Interest {
        Interest(ERROR)
    }

    /// Peer hang-up notification (`EPOLLRDHUP`).
    #[inline]
    pub fn hup() -> Interest {
        Interest(HUP)
    }

    /// Out-of-band data notification (`EPOLLPRI`).
    #[inline]
    pub fn priority() -> Interest {
        Interest(PRIORITY)
    }

    /// Edge-triggered delivery (`EPOLLET`).
    #[inline]
    pub fn edge() -> Interest {
        Interest(EDGE)
    }

    /// The mask a stream socket registers with: every readiness kind,
    /// edge-triggered.
    pub fn stream() -> Interest {
        Interest::readable()
            | Interest::writable()
            | Interest::hup()
            | Interest::priority()
            | Interest::edge()
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(Interest::readable())
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(Interest::writable())
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.contains(Interest::error())
    }

    #[inline]
    pub fn is_hup(self) -> bool {
        self.contains(Interest::hup())
    }

    #[inline]
    pub fn is_priority(self) -> bool {
        self.contains(Interest::priority())
    }

    #[inline]
    pub fn is_edge(self) -> bool {
        self.contains(Interest::edge())
    }

    #[inline]
    pub fn contains(self, other: Interest) -> bool {
        (self & other) == other
    }

    #[inline]
    pub fn insert(&mut self, other: Interest) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Interest) {
        self.0 &= !other.0;
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    #[inline]
    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

impl ops::BitAnd for Interest {
    type Output = Interest;

    #[inline]
    fn bitand(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

impl ops::Sub for Interest {
    type Output = Interest;

    #[inline]
    fn sub(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl From<usize> for Interest {
    fn from(mask: usize) -> Interest {
        Interest(mask)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Interest::readable(), "Readable"),
            (Interest::writable(), "Writable"),
            (Interest::error(), "Error"),
            (Interest::hup(), "Hup"),
            (Interest::priority(), "Priority"),
            (Interest::edge(), "Edge-Triggered"),
        ];

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Interest;

    #[test]
    fn stream_mask() {
        let interest = Interest::stream();
        assert!(interest.is_readable());
        assert!(interest.is_writable());
        assert!(interest.is_hup());
        assert!(interest.is_priority());
        assert!(interest.is_edge());

        let no_read = interest - Interest::readable();
        assert!(!no_read.is_readable());
        assert!(no_read.is_edge());
    }
}
