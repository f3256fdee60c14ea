//! Sampling strategies gating which hook invocations get recorded.
//!
//! Both strategies run inline on the allocating thread: they never lock and
//! never allocate. Per-thread state lives in [`ThreadContext`]; shared state
//! is a single atomic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::context::ThreadContext;

/// Wall-clock source in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Decides whether the current hook invocation proceeds to recording.
pub trait SampleStrategy: Send + Sync {
    fn can_sample(&self, cx: &mut ThreadContext) -> bool;
}

/// Uniform draw from `[-jitter, jitter)`, or 0 when jitter is 0.
#[inline]
fn draw_jitter(jitter: u64) -> i64 {
    if jitter == 0 {
        return 0;
    }
    let bound = jitter.min(i64::MAX as u64) as i64;
    fastrand::i64(-bound..bound)
}

/// Per-thread allocation counting.
///
/// Each thread samples its first allocation after `start_ms`, then every
/// Nth allocation where N is `rate + jitter`, redrawn after every sample.
#[derive(Debug)]
pub struct AllocationCountSampler<C: Clock = SystemClock> {
    start_ms: u64,
    rate: u64,
    jitter: u64,
    clock: C,
}

impl AllocationCountSampler {
    pub fn new(start_ms: u64, rate: u64, jitter: u64) -> Self {
        Self::with_clock(start_ms, rate, jitter, SystemClock)
    }
}

impl<C: Clock> AllocationCountSampler<C> {
    pub fn with_clock(start_ms: u64, rate: u64, jitter: u64, clock: C) -> Self {
        Self {
            start_ms,
            rate,
            jitter,
            clock,
        }
    }

    #[inline]
    fn next_rate(&self) -> u64 {
        let rate = self.rate.min(i64::MAX as u64) as i64;
        // A draw can push the rate to zero or below; sample the next call then.
        rate.saturating_add(draw_jitter(self.jitter)).max(1) as u64
    }
}

impl<C: Clock> SampleStrategy for AllocationCountSampler<C> {
    fn can_sample(&self, cx: &mut ThreadContext) -> bool {
        match cx.sample_rate {
            None => {
                if self.clock.now_millis() > self.start_ms {
                    cx.sample_count = 0;
                    cx.sample_rate = Some(self.next_rate());
                    true
                } else {
                    false
                }
            }
            Some(rate) => {
                let count = cx.sample_count + 1;
                if count >= rate {
                    cx.sample_count = 0;
                    cx.sample_rate = Some(self.next_rate());
                    true
                } else {
                    cx.sample_count = count;
                    false
                }
            }
        }
    }
}

/// Process-wide periodic sampling: at most one acceptance per interval.
#[derive(Debug)]
pub struct PeriodicSampler<C: Clock = SystemClock> {
    next_sample_ms: AtomicU64,
    interval_ms: u64,
    jitter: u64,
    clock: C,
}

impl PeriodicSampler {
    pub fn new(start_ms: u64, interval_ms: u64, jitter: u64) -> Self {
        Self::with_clock(start_ms, interval_ms, jitter, SystemClock)
    }
}

impl<C: Clock> PeriodicSampler<C> {
    pub fn with_clock(start_ms: u64, interval_ms: u64, jitter: u64, clock: C) -> Self {
        Self {
            next_sample_ms: AtomicU64::new(start_ms),
            interval_ms,
            jitter,
            clock,
        }
    }

    /// Earliest timestamp at which the next sample may be taken.
    pub fn next_sample_ms(&self) -> u64 {
        self.next_sample_ms.load(Ordering::Acquire)
    }
}

impl<C: Clock> SampleStrategy for PeriodicSampler<C> {
    fn can_sample(&self, _cx: &mut ThreadContext) -> bool {
        let now = self.clock.now_millis();
        let next = self.next_sample_ms.load(Ordering::Acquire);
        if now <= next {
            return false;
        }
        let step = (self.interval_ms.min(i64::MAX as u64) as i64)
            .saturating_add(draw_jitter(self.jitter))
            .max(0) as u64;
        self.next_sample_ms
            .compare_exchange(next, now.saturating_add(step), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}
