//! Lookback window over already-produced output
//!
//! Transports retry failed requests by asking for the same range again. The
//! writer produces ciphertext exactly once, so the tail of what it produced
//! is kept here and re-requests are answered from it.

use bytes::Bytes;

#[derive(Debug)]
pub struct ResumeCache {
    /// Offset of `buf[0]`
    base: u64,
    buf: Vec<u8>,
    capacity: usize,
}

impl ResumeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            base: 0,
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// First offset still held.
    pub fn start(&self) -> u64 {
        self.base
    }

    /// One past the last offset appended.
    pub fn end(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Grow the window so a single range of `len` bytes always fits.
    pub fn ensure_capacity(&mut self, len: usize) {
        if len > self.capacity {
            self.capacity = len;
        }
    }

    /// Append bytes at `end()`, evicting the oldest beyond capacity.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.capacity {
            let evict = self.buf.len() - self.capacity;
            self.buf.drain(..evict);
            self.base += evict as u64;
        }
    }

    pub fn contains(&self, start: u64, end: u64) -> bool {
        start >= self.base && end <= self.end() && start <= end
    }

    /// Copy of `[start, end)` if it is entirely inside the window.
    pub fn get(&self, start: u64, end: u64) -> Option<Bytes> {
        if !self.contains(start, end) {
            return None;
        }
        let from = (start - self.base) as usize;
        let to = (end - self.base) as usize;
        Some(Bytes::copy_from_slice(&self.buf[from..to]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serves_recent_ranges() {
        let mut cache = ResumeCache::new(8);
        cache.append(b"abcd");
        cache.append(b"efgh");
        assert_eq!(cache.get(2, 6).as_deref(), Some(&b"cdef"[..]));
        assert_eq!(cache.get(8, 8).as_deref(), Some(&b""[..]));
        assert_eq!(cache.get(6, 9), None);
    }

    #[test]
    fn test_evicts_oldest_bytes() {
        let mut cache = ResumeCache::new(8);
        cache.append(b"0123456789");
        assert_eq!(cache.start(), 2);
        assert_eq!(cache.end(), 10);
        assert_eq!(cache.get(0, 4), None);
        assert_eq!(cache.get(2, 10).as_deref(), Some(&b"23456789"[..]));
    }

    #[test]
    fn test_capacity_only_grows() {
        let mut cache = ResumeCache::new(16);
        cache.ensure_capacity(4);
        assert_eq!(cache.capacity(), 16);
        cache.ensure_capacity(64);
        assert_eq!(cache.capacity(), 64);
    }
}
