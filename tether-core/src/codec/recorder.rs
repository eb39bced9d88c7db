//! Flight recorder — a fixed ring buffer retaining the most recent
//! wire bytes seen by the decoder.
//!
//! When deserialization fails, the snapshot is attached to the
//! `StreamCorruption` diagnostic so the broken byte stream can be
//! inspected after the fact.

/// Default retention, in bytes.
pub const DEFAULT_RECORDER_CAPACITY: usize = 64 * 1024;

/// Ring buffer over the last `capacity` bytes fed to [`record`].
///
/// [`record`]: FlightRecorder::record
#[derive(Debug)]
pub struct FlightRecorder {
    buf: Box<[u8]>,
    /// Next write position.
    head: usize,
    /// Number of valid bytes (≤ capacity).
    len: usize,
    /// Total bytes ever recorded.
    total: u64,
}

impl FlightRecorder {
    /// Create a recorder retaining up to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            head: 0,
            len: 0,
            total: 0,
        }
    }

    /// Append bytes, evicting the oldest when full.
    pub fn record(&mut self, bytes: &[u8]) {
        self.total += bytes.len() as u64;
        let cap = self.buf.len();

        // Only the final `cap` bytes of the input can survive.
        let bytes = if bytes.len() > cap {
            &bytes[bytes.len() - cap..]
        } else {
            bytes
        };

        let first = (cap - self.head).min(bytes.len());
        self.buf[self.head..self.head + first].copy_from_slice(&bytes[..first]);
        let rest = &bytes[first..];
        self.buf[..rest.len()].copy_from_slice(rest);

        self.head = (self.head + bytes.len()) % cap;
        self.len = (self.len + bytes.len()).min(cap);
    }

    /// The retained bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let cap = self.buf.len();
        let start = (self.head + cap - self.len) % cap;
        let mut out = Vec::with_capacity(self.len);
        if start + self.len <= cap {
            out.extend_from_slice(&self.buf[start..start + self.len]);
        } else {
            out.extend_from_slice(&self.buf[start..]);
            out.extend_from_slice(&self.buf[..self.len - (cap - start)]);
        }
        out
    }

    /// Maximum number of retained bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes recorded over the recorder's lifetime.
    pub fn total_recorded(&self) -> u64 {
        self.total
    }
}
