//! Growable ring buffer used for outbound pipe traffic.
//!
//! Writers append whole messages; the pipe drain path peeks at the
//! readable chunks (at most two, when the data wraps) and commits what
//! the kernel accepted. The buffer grows on demand but refuses to grow
//! past a hard ceiling.

use crate::WireError;

#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    read: usize,
    used: usize,
    max_capacity: usize,
}

impl RingBuffer {
    /// `initial` must be non-zero; `max_capacity` bounds growth.
    #[must_use]
    pub fn new(initial: usize, max_capacity: usize) -> RingBuffer {
        assert!(initial > 0 && initial <= max_capacity);
        RingBuffer {
            buf: vec![0; initial],
            read: 0,
            used: 0,
            max_capacity,
        }
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn grow_for(&mut self, extra: usize) -> Result<(), WireError> {
        let needed = self.used + extra;
        if needed <= self.buf.len() {
            return Ok(());
        }
        if needed > self.max_capacity {
            return Err(WireError::RingFull);
        }
        let mut new_cap = self.buf.len().max(1);
        while new_cap < needed {
            new_cap *= 2;
        }
        new_cap = new_cap.min(self.max_capacity);

        // Linearize into the new allocation.
        let mut new_buf = vec![0; new_cap];
        let (a, b) = self.readable();
        new_buf[..a.len()].copy_from_slice(a);
        new_buf[a.len()..a.len() + b.len()].copy_from_slice(b);
        self.buf = new_buf;
        self.read = 0;
        Ok(())
    }

    /// Append `data`, growing if necessary.
    pub fn write(&mut self, data: &[u8]) -> Result<(), WireError> {
        self.grow_for(data.len())?;
        let cap = self.buf.len();
        let write = (self.read + self.used) % cap;
        let first = (cap - write).min(data.len());
        self.buf[write..write + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            let rest = data.len() - first;
            self.buf[..rest].copy_from_slice(&data[first..]);
        }
        self.used += data.len();
        Ok(())
    }

    /// The readable chunks, in order. The second slice is empty unless
    /// the data wraps around the end of the buffer.
    #[must_use]
    pub fn readable(&self) -> (&[u8], &[u8]) {
        let cap = self.buf.len();
        let first = (cap - self.read).min(self.used);
        let a = &self.buf[self.read..self.read + first];
        let b = &self.buf[..self.used - first];
        (a, b)
    }

    /// Consume `n` bytes from the front.
    pub fn commit_read(&mut self, n: usize) {
        let n = n.min(self.used);
        self.read = (self.read + n) % self.buf.len();
        self.used -= n;
        if self.used == 0 {
            self.read = 0;
        }
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.read = 0;
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_wraps() {
        let mut ring = RingBuffer::new(8, 64);
        ring.write(b"abcdef").unwrap();
        ring.commit_read(4);
        ring.write(b"ghij").unwrap(); // wraps
        let (a, b) = ring.readable();
        let mut all = a.to_vec();
        all.extend_from_slice(b);
        assert_eq!(all, b"efghij");
        assert!(!b.is_empty());
    }

    #[test]
    fn grows_on_demand_and_respects_ceiling() {
        let mut ring = RingBuffer::new(4, 16);
        ring.write(&[1; 10]).unwrap();
        assert!(ring.capacity() >= 10);
        assert!(matches!(ring.write(&[2; 7]), Err(WireError::RingFull)));
        // Still intact after the refused write.
        assert_eq!(ring.used(), 10);
    }

    #[test]
    fn commit_resets_when_empty() {
        let mut ring = RingBuffer::new(8, 8);
        ring.write(b"xyz").unwrap();
        ring.commit_read(3);
        assert!(ring.is_empty());
        ring.write(b"12345678").unwrap();
        let (a, b) = ring.readable();
        assert_eq!(a, b"12345678");
        assert!(b.is_empty());
    }
}
