//! Bounded inbound byte channel
//!
//! Fixed-capacity ring buffer between the read dispatcher (single producer)
//! and pull-on-demand consumers. The occupancy invariant holds under all
//! interleavings: unread bytes never exceed the configured capacity.
//!
//! Overflow behavior is a policy choice. `Block` (the default) stalls the
//! producer until a consumer frees space and loses no data; `DropOldest`
//! discards the oldest unread bytes to bound latency. The lock protecting
//! the ring is never held across device I/O or callback invocation.

use serde::{Deserialize, Serialize};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// What to do when the channel is full and new device data arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Block the producer until a consumer frees space. No data loss.
    #[default]
    Block,
    /// Discard the oldest unread bytes to make room. Accepts data loss.
    DropOldest,
}

/// Occupancy counters, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Total inbound bytes, whether buffered or handed straight to a
    /// callback.
    pub received: u64,
    /// Total unread bytes discarded under `DropOldest`.
    pub dropped: u64,
}

struct Ring {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
    closed: bool,
    stats: ChannelStats,
}

impl Ring {
    /// Copy `data` in at the tail. Caller has verified there is room.
    fn write(&mut self, data: &[u8]) {
        let cap = self.buf.len();
        let pos = (self.head + self.len) % cap;
        let first = (cap - pos).min(data.len());
        self.buf[pos..pos + first].copy_from_slice(&data[..first]);
        if data.len() > first {
            let rest = data.len() - first;
            self.buf[..rest].copy_from_slice(&data[first..]);
        }
        self.len += data.len();
        self.stats.received += data.len() as u64;
    }

    /// Discard the oldest `n` unread bytes.
    fn discard(&mut self, n: usize) {
        let n = n.min(self.len);
        self.head = (self.head + n) % self.buf.len();
        self.len -= n;
        self.stats.dropped += n as u64;
    }

    /// Move up to `out.len()` bytes out, oldest first.
    fn read_into(&mut self, out: &mut [u8]) -> usize {
        let n = self.len.min(out.len());
        let cap = self.buf.len();
        let first = (cap - self.head).min(n);
        out[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        if n > first {
            out[first..n].copy_from_slice(&self.buf[..n - first]);
        }
        self.head = (self.head + n) % cap;
        self.len -= n;
        n
    }
}

/// Fixed-capacity byte channel with blocking or drop-oldest backpressure.
pub struct BoundedChannel {
    ring: Mutex<Ring>,
    space_freed: Condvar,
    data_ready: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

impl BoundedChannel {
    /// Allocate a channel holding up to `capacity` bytes of unread data.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> crate::Result<Self> {
        if capacity == 0 {
            return Err(crate::Error::InvalidCapacity);
        }
        Ok(Self {
            ring: Mutex::new(Ring {
                buf: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                len: 0,
                closed: false,
                stats: ChannelStats::default(),
            }),
            space_freed: Condvar::new(),
            data_ready: Condvar::new(),
            capacity,
            policy,
        })
    }

    /// Channel capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Unread bytes currently buffered.
    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().len
    }

    /// Whether no unread bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Received/dropped byte counters.
    pub fn stats(&self) -> ChannelStats {
        self.ring.lock().unwrap().stats
    }

    /// Push device bytes per the overflow policy.
    ///
    /// Under `Block` this stalls until consumers free enough space for the
    /// whole chunk, writing it in segments as room appears. Returns false if
    /// the channel was closed before the chunk was fully accepted; any
    /// remainder is discarded (this only happens during shutdown).
    pub fn push(&self, data: &[u8]) -> bool {
        let mut ring = self.ring.lock().unwrap();
        match self.policy {
            OverflowPolicy::Block => {
                let mut offset = 0;
                while offset < data.len() {
                    if ring.closed {
                        return false;
                    }
                    let free = self.capacity - ring.len;
                    if free == 0 {
                        ring = self.space_freed.wait(ring).unwrap();
                        continue;
                    }
                    let take = free.min(data.len() - offset);
                    ring.write(&data[offset..offset + take]);
                    offset += take;
                    self.data_ready.notify_all();
                }
            }
            OverflowPolicy::DropOldest => {
                if ring.closed {
                    return false;
                }
                // A chunk larger than the whole ring keeps only its newest bytes.
                let data = if data.len() > self.capacity {
                    &data[data.len() - self.capacity..]
                } else {
                    data
                };
                let overflow = (ring.len + data.len()).saturating_sub(self.capacity);
                if overflow > 0 {
                    ring.discard(overflow);
                    warn!(
                        dropped = overflow,
                        total_dropped = ring.stats.dropped,
                        "channel full, discarded oldest unread bytes"
                    );
                }
                ring.write(data);
                self.data_ready.notify_all();
            }
        }
        trace!(len = data.len(), buffered = ring.len, "buffered inbound bytes");
        true
    }

    /// Drain up to `out.len()` bytes without blocking. Returns 0 when empty.
    pub fn pop(&self, out: &mut [u8]) -> usize {
        let mut ring = self.ring.lock().unwrap();
        let n = ring.read_into(out);
        if n > 0 {
            self.space_freed.notify_all();
        }
        n
    }

    /// Account `n` inbound bytes handed straight to a callback without
    /// being buffered, so `stats().received` covers both delivery modes.
    pub fn record_delivered(&self, n: usize) {
        self.ring.lock().unwrap().stats.received += n as u64;
    }

    /// Drain up to `out.len()` bytes, waiting up to `timeout` for the first
    /// byte to arrive. Returns 0 on timeout or if the channel closed empty.
    pub fn pop_timeout(&self, out: &mut [u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock().unwrap();
        while ring.len == 0 && !ring.closed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return 0;
            }
            ring = self.data_ready.wait_timeout(ring, remaining).unwrap().0;
        }
        let n = ring.read_into(out);
        if n > 0 {
            self.space_freed.notify_all();
        }
        n
    }

    /// Close the channel: wakes a blocked producer and any waiting
    /// consumers; subsequent pushes are rejected. Buffered bytes remain
    /// readable until `clear`.
    pub fn close(&self) {
        let mut ring = self.ring.lock().unwrap();
        ring.closed = true;
        self.space_freed.notify_all();
        self.data_ready.notify_all();
    }

    /// Release all unread bytes (shutdown path; not counted as drops).
    pub fn clear(&self) {
        let mut ring = self.ring.lock().unwrap();
        ring.head = 0;
        ring.len = 0;
        self.space_freed.notify_all();
    }
}
