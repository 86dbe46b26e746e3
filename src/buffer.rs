use std::cmp;
use std::fmt;
use std::io;

/// An abstract producer of bytes, typically the kernel receive queue of a
/// socket. Short reads are legal and signal that the source has, for now,
/// run dry.
pub trait DataSource {
    /// Bytes the source could deliver right now.
    fn data_available(&self) -> usize;

    /// Copies up to `buf.len()` bytes into `buf`, returning the number of
    /// bytes moved.
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// An abstract consumer of bytes. Short writes are legal and signal
/// backpressure.
pub trait DataSink {
    /// Consumes up to `data.len()` bytes from `data`, returning the number
    /// of bytes moved.
    fn write(&mut self, data: &[u8]) -> usize;
}

const MIN_STORAGE: usize = 64;
const PROBE_CHUNK: usize = 4096;

/// A byte ring with two-phase bulk transfers against [`DataSource`] /
/// [`DataSink`] endpoints.
///
/// Storage grows on demand; an optional capacity bound makes [`is_full`]
/// flip once the bound is reached, which is the signal owners use to stop
/// pulling from their source until the buffer is drained.
///
/// [`is_full`]: RingBuffer::is_full
pub struct RingBuffer {
    buf: Vec<u8>,
    head: usize,
    len: usize,
    limit: usize,
}

impl RingBuffer {
    /// An unbounded buffer; `is_full()` never becomes true.
    pub fn new() -> RingBuffer {
        RingBuffer {
            buf: Vec::new(),
            head: 0,
            len: 0,
            limit: usize::MAX,
        }
    }

    /// A buffer that reports full once it holds `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> RingBuffer {
        assert!(capacity > 0);
        RingBuffer {
            buf: Vec::new(),
            head: 0,
            len: 0,
            limit: capacity,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len >= self.limit
    }

    /// Bytes that can still be written before the buffer reports full.
    #[inline]
    pub fn free_space(&self) -> usize {
        self.limit.saturating_sub(self.len)
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Appends up to `free_space()` bytes from `data`, returning the number
    /// of bytes taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let count = cmp::min(data.len(), self.free_space());
        if count == 0 {
            return 0;
        }
        self.reserve(count);
        let mut written = 0;
        while written < count {
            let (start, span) = self.free_span(count - written);
            self.buf[start..start + span].copy_from_slice(&data[written..written + span]);
            self.len += span;
            written += span;
        }
        written
    }

    /// Copies up to `buf.len()` bytes out of the front without consuming.
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        let count = cmp::min(buf.len(), self.len);
        let mut copied = 0;
        let mut head = self.head;
        while copied < count {
            let span = cmp::min(count - copied, self.buf.len() - head);
            buf[copied..copied + span].copy_from_slice(&self.buf[head..head + span]);
            head = (head + span) % self.buf.len();
            copied += span;
        }
        count
    }

    /// Copies up to `buf.len()` bytes out of the front and consumes them.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let count = self.peek(buf);
        self.consume(count);
        count
    }

    /// Drops up to `count` bytes from the front, returning the number
    /// dropped.
    pub fn pop_front(&mut self, count: usize) -> usize {
        let count = cmp::min(count, self.len);
        self.consume(count);
        count
    }

    /// Takes the whole contents out of the buffer.
    pub fn read_all(&mut self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.read(&mut out[..]);
        out
    }

    /// Pulls from `source` until the buffer is full or the source delivers a
    /// short read. Crossing the wrap point costs a second `source.read`.
    pub fn write_from(&mut self, source: &mut dyn DataSource) -> usize {
        let mut total = 0;
        loop {
            if self.is_full() {
                break;
            }
            let mut want = source.data_available();
            if want == 0 {
                // probe; a short read ends the loop
                want = PROBE_CHUNK;
            }
            let want = cmp::min(want, self.free_space());
            self.reserve(want);
            let (start, span) = self.free_span(want);
            let n = source.read(&mut self.buf[start..start + span]);
            self.len += n;
            total += n;
            if n < span {
                break;
            }
        }
        total
    }

    /// Pushes into `sink` until the buffer is empty or the sink accepts a
    /// short write. Crossing the wrap point costs a second `sink.write`.
    pub fn read_into(&mut self, sink: &mut dyn DataSink) -> usize {
        let mut total = 0;
        while self.len > 0 {
            let (start, span) = self.data_span();
            let n = sink.write(&self.buf[start..start + span]);
            self.consume(n);
            total += n;
            if n < span {
                break;
            }
        }
        total
    }

    fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len);
        self.len -= count;
        if self.len == 0 {
            self.head = 0;
        } else {
            self.head = (self.head + count) % self.buf.len();
        }
    }

    /// First contiguous run of data starting at the head.
    fn data_span(&self) -> (usize, usize) {
        let span = cmp::min(self.len, self.buf.len() - self.head);
        (self.head, span)
    }

    /// First contiguous run of free storage, at most `want` bytes. Callers
    /// must `reserve` first.
    fn free_span(&self, want: usize) -> (usize, usize) {
        debug_assert!(self.buf.len() - self.len >= 1 || want == 0);
        let tail = if self.buf.is_empty() {
            0
        } else {
            (self.head + self.len) % self.buf.len()
        };
        let contiguous = if tail >= self.head {
            self.buf.len() - tail
        } else {
            self.head - tail
        };
        (tail, cmp::min(want, contiguous))
    }

    /// Grows storage so at least `additional` free bytes exist, relocating
    /// the contents to the start when reallocating.
    fn reserve(&mut self, additional: usize) {
        if self.buf.len() - self.len >= additional {
            return;
        }
        let new_cap = cmp::max(MIN_STORAGE, (self.len + additional).next_power_of_two());
        let mut new_buf = vec![0u8; new_cap];
        let count = self.peek_into(&mut new_buf);
        debug_assert_eq!(count, self.len);
        self.buf = new_buf;
        self.head = 0;
    }

    fn peek_into(&self, out: &mut [u8]) -> usize {
        let count = cmp::min(out.len(), self.len);
        let mut copied = 0;
        let mut head = self.head;
        while copied < count {
            let span = cmp::min(count - copied, self.buf.len() - head);
            out[copied..copied + span].copy_from_slice(&self.buf[head..head + span]);
            head = (head + span) % self.buf.len();
            copied += span;
        }
        count
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        RingBuffer::new()
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "RingBuffer {{ size: {}, capacity: {} }}",
            self.len, self.limit
        )
    }
}

impl io::Read for RingBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(RingBuffer::read(self, buf))
    }
}

impl io::Write for RingBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let written = RingBuffer::write(self, data);
        if written == 0 && !data.is_empty() {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        } else {
            Ok(written)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct SliceSource<'a> {
        data: &'a [u8],
        max_per_read: usize,
    }

    impl DataSource for SliceSource<'_> {
        fn data_available(&self) -> usize {
            self.data.len()
        }

        fn read(&mut self, buf: &mut [u8]) -> usize {
            let n = buf.len().min(self.data.len()).min(self.max_per_read);
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            n
        }
    }

    struct VecSink {
        data: Vec<u8>,
        max_per_write: usize,
    }

    impl DataSink for VecSink {
        fn write(&mut self, data: &[u8]) -> usize {
            let n = data.len().min(self.max_per_write);
            self.data.extend_from_slice(&data[..n]);
            n
        }
    }

    #[test]
    fn write_read_round_trip() {
        let mut ring = RingBuffer::new();
        assert_eq!(ring.write(b"hello world"), 11);
        assert_eq!(ring.size(), 11);

        let mut out = [0u8; 5];
        assert_eq!(ring.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(ring.size(), 6);
        assert_eq!(ring.read_all(), b" world");
        assert!(ring.is_empty());
    }

    #[test]
    fn bounded_buffer_reports_full() {
        let mut ring = RingBuffer::with_capacity(8);
        assert_eq!(ring.write(b"0123456789"), 8);
        assert!(ring.is_full());
        assert_eq!(ring.free_space(), 0);
        assert_eq!(ring.write(b"x"), 0);

        ring.pop_front(3);
        assert!(!ring.is_full());
        assert_eq!(ring.write(b"abc"), 3);
        assert_eq!(ring.read_all(), b"34567abc");
    }

    #[test]
    fn data_survives_wrap_around() {
        let mut ring = RingBuffer::with_capacity(8);
        ring.write(b"abcdefgh");
        ring.pop_front(5);
        // head is mid-storage now; this write wraps
        assert_eq!(ring.write(b"12345"), 5);
        assert_eq!(ring.read_all(), b"fgh12345");
    }

    #[test]
    fn peek_does_not_consume() {
        let mut ring = RingBuffer::new();
        ring.write(b"abc");
        let mut out = [0u8; 3];
        assert_eq!(ring.peek(&mut out), 3);
        assert_eq!(&out, b"abc");
        assert_eq!(ring.size(), 3);
    }

    #[test]
    fn write_from_stops_at_capacity() {
        let mut ring = RingBuffer::with_capacity(16);
        let mut source = SliceSource {
            data: &[7u8; 64],
            max_per_read: usize::MAX,
        };
        assert_eq!(ring.write_from(&mut source), 16);
        assert!(ring.is_full());
    }

    #[test]
    fn write_from_stops_on_short_read() {
        let mut ring = RingBuffer::with_capacity(64);
        let mut source = SliceSource {
            data: b"abcdef",
            max_per_read: 4,
        };
        assert_eq!(ring.write_from(&mut source), 6);
        assert_eq!(ring.read_all(), b"abcdef");
    }

    #[test]
    fn read_into_respects_backpressure() {
        let mut ring = RingBuffer::new();
        ring.write(b"0123456789");
        let mut sink = VecSink {
            data: Vec::new(),
            max_per_write: 4,
        };
        assert_eq!(ring.read_into(&mut sink), 4);
        assert_eq!(ring.size(), 6);
        assert_eq!(sink.data, b"0123");
    }

    #[test]
    fn read_into_drains_across_wrap() {
        let mut ring = RingBuffer::with_capacity(8);
        ring.write(b"abcdefgh");
        ring.pop_front(6);
        ring.write(b"123456");
        let mut sink = VecSink {
            data: Vec::new(),
            max_per_write: usize::MAX,
        };
        assert_eq!(ring.read_into(&mut sink), 8);
        assert_eq!(sink.data, b"gh123456");
        assert!(ring.is_empty());
    }
}
