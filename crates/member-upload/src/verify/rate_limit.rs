use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::VerifyConfig;

const COUNT_BITS: u32 = 20;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

/// How a caller reacts to an exhausted window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Return immediately with the time until the window resets.
    FailFast,
    /// Sleep until the window resets, for at most this long in total.
    Wait(Duration),
}

/// Snapshot of the verification budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    pub resets_in_secs: u64,
    pub can_upload: bool,
}

/// Fixed-window limiter shared by every worker.
///
/// The window start (milliseconds since the limiter was created) and the
/// call count live in one `AtomicU64`, so a window reset and the first
/// increment of the new window land in a single compare-and-swap. No two
/// callers can both observe a fresh window and both start counting from zero.
pub struct RateLimiter {
    state: AtomicU64,
    limit: u32,
    window: Duration,
    origin: Instant,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        let capped = (limit as u64).min(COUNT_MASK) as u32;
        if capped != limit {
            warn!("Rate limit {} exceeds supported maximum, capped to {}", limit, capped);
        }
        Self {
            state: AtomicU64::new(0),
            limit: capped,
            window: window.max(Duration::from_millis(1)),
            origin: Instant::now(),
        }
    }

    pub fn from_config(config: &VerifyConfig) -> Self {
        Self::new(config.rate_limit, config.rate_window())
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    fn unpack(state: u64) -> (u64, u32) {
        (state >> COUNT_BITS, (state & COUNT_MASK) as u32)
    }

    fn pack(start_ms: u64, count: u32) -> u64 {
        (start_ms << COUNT_BITS) | (count as u64 & COUNT_MASK)
    }

    /// Window start and count as they apply at `now_ms`.
    fn current(&self, state: u64, now_ms: u64) -> (u64, u32) {
        let (start, count) = Self::unpack(state);
        if now_ms.saturating_sub(start) >= self.window_ms() {
            (now_ms, 0)
        } else {
            (start, count)
        }
    }

    /// Takes one unit of budget, or returns the time until the window resets.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut observed = self.state.load(Ordering::Acquire);
        loop {
            let now = self.now_ms();
            let (start, count) = self.current(observed, now);

            if count >= self.limit {
                let resets_in = (start + self.window_ms()).saturating_sub(now);
                return Err(Duration::from_millis(resets_in.max(1)));
            }

            let next = Self::pack(start, count + 1);
            match self.state.compare_exchange_weak(
                observed,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => observed = actual,
            }
        }
    }

    pub fn acquire(&self, mode: AcquireMode) -> Result<(), Duration> {
        match mode {
            AcquireMode::FailFast => self.try_acquire(),
            AcquireMode::Wait(max_wait) => {
                let deadline = Instant::now() + max_wait;
                loop {
                    match self.try_acquire() {
                        Ok(()) => return Ok(()),
                        Err(resets_in) => {
                            if Instant::now() + resets_in > deadline {
                                return Err(resets_in);
                            }
                            thread::sleep(resets_in);
                        }
                    }
                }
            }
        }
    }

    pub fn status(&self) -> RateLimitStatus {
        let now = self.now_ms();
        let (start, count) = self.current(self.state.load(Ordering::Acquire), now);
        let remaining = self.limit.saturating_sub(count);
        let resets_in_ms = (start + self.window_ms()).saturating_sub(now);

        RateLimitStatus {
            limit: self.limit,
            remaining,
            resets_in_secs: resets_in_ms.div_ceil(1000),
            can_upload: remaining > 0,
        }
    }
}
