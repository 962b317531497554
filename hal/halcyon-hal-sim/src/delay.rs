//! Simulated time
//!
//! One [`SimClock`] per chip drives everything time-based in the
//! simulation: blocking waits, the timers and the RTC all read it, and
//! only [`SimDelay`] or an explicit [`SimClock::advance`] moves it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use embedded_hal::delay::DelayNs;

/// Shared nanosecond counter
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now_ns: Arc<AtomicU64>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    pub fn advance_ns(&self, ns: u64) {
        self.now_ns.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_ns(ms * 1_000_000);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance_ns(secs * 1_000_000_000);
    }
}

/// Delay that advances the simulated clock instead of sleeping
///
/// A hook can run on every delay call, which is how tests make the
/// simulated hardware progress while a driver is blocked in a poll loop.
pub struct SimDelay {
    clock: SimClock,
    calls: u64,
    hook: Option<Box<dyn FnMut(u64) + Send>>,
}

impl SimDelay {
    pub fn new(clock: SimClock) -> Self {
        Self {
            clock,
            calls: 0,
            hook: None,
        }
    }

    /// Run `hook` with the new time after every delay
    pub fn with_hook(clock: SimClock, hook: impl FnMut(u64) + Send + 'static) -> Self {
        Self {
            clock,
            calls: 0,
            hook: Some(Box::new(hook)),
        }
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    /// Number of delay calls so far
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.clock.advance_ns(u64::from(ns));
        self.calls += 1;
        if let Some(hook) = self.hook.as_mut() {
            hook(self.clock.now_ns());
        }
    }
}
