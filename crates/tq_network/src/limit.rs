//! Per-connection abuse controls: token buckets, the sliding flood
//! window, and packet-type diversity tracking.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use thiserror::Error;

/// Fatal rate-control violations.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum RateLimitError {
    #[error("packet rate limit exceeded")]
    PacketRate,
    #[error("byte rate limit exceeded")]
    ByteRate,
    #[error("flood detected")]
    Flood,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    waiters: usize,
}

/// A token bucket with a bounded waiter queue. `acquire` suspends until
/// tokens refill; once `max_waiters` callers are already parked, further
/// acquisitions fail instead of queueing.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    max_waiters: usize,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32, max_waiters: usize) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(refill_per_sec),
            max_waiters,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
                waiters: 0,
            }),
        }
    }

    /// The packet-count limiter: 100 packets/s, short queue.
    pub fn packets() -> Self {
        Self::new(100, 100, 10)
    }

    /// The byte-rate limiter: 100 000 B/s, shorter queue.
    pub fn bytes() -> Self {
        Self::new(100_000, 100_000, 5)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Takes `n` tokens if immediately available.
    pub fn try_acquire(&self, n: u32) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        if state.tokens >= f64::from(n) {
            state.tokens -= f64::from(n);
            true
        } else {
            false
        }
    }

    /// Takes `n` tokens, waiting for refill when necessary. Returns false
    /// when the request can never be satisfied or the waiter queue is
    /// full, which callers treat as a fatal rate violation.
    pub async fn acquire(&self, n: u32) -> bool {
        let need = f64::from(n);
        if need > self.capacity {
            return false;
        }
        let mut queued = false;
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state, Instant::now());
                if state.tokens >= need {
                    state.tokens -= need;
                    if queued {
                        state.waiters -= 1;
                    }
                    return true;
                }
                if !queued {
                    if state.waiters >= self.max_waiters {
                        return false;
                    }
                    state.waiters += 1;
                    queued = true;
                }
                Duration::from_secs_f64((need - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Sliding window flood detector: more than `max_packets` inside
/// `window` is a violation. Entries older than the window are pruned on
/// every observation, so the count never includes them.
pub struct FloodWindow {
    window: Duration,
    max_packets: usize,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl FloodWindow {
    pub fn new(window: Duration, max_packets: usize) -> Self {
        Self {
            window,
            max_packets,
            timestamps: Mutex::new(VecDeque::with_capacity(max_packets + 1)),
        }
    }

    /// The production window: 10 packets per 100 ms.
    pub fn standard() -> Self {
        Self::new(Duration::from_millis(100), 10)
    }

    /// Records one packet arrival. Returns false on flood.
    pub fn record(&self, now: Instant) -> bool {
        let mut q = self.timestamps.lock();
        while q
            .front()
            .is_some_and(|&t| now.duration_since(t) > self.window)
        {
            q.pop_front();
        }
        q.push_back(now);
        q.len() <= self.max_packets
    }

    /// Packets currently inside the window.
    pub fn len(&self, now: Instant) -> usize {
        let mut q = self.timestamps.lock();
        while q
            .front()
            .is_some_and(|&t| now.duration_since(t) > self.window)
        {
            q.pop_front();
        }
        q.len()
    }
}

/// Tracks how many distinct packet types a client has sent since the
/// last reset. High cardinality is suspicious but not fatal; the caller
/// logs and moves on.
pub struct TypeDiversity {
    threshold: usize,
    seen: Mutex<FxHashSet<u16>>,
}

impl TypeDiversity {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            seen: Mutex::new(FxHashSet::default()),
        }
    }

    /// The production threshold of 50 distinct types.
    pub fn standard() -> Self {
        Self::new(50)
    }

    /// Records a type; returns true when cardinality now exceeds the
    /// threshold.
    pub fn record(&self, packet_type: u16) -> bool {
        let mut seen = self.seen.lock();
        seen.insert(packet_type);
        seen.len() > self.threshold
    }

    pub fn reset(&self) {
        self.seen.lock().clear();
    }

    pub fn cardinality(&self) -> usize {
        self.seen.lock().len()
    }
}
