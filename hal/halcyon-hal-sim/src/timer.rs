//! Simulated counter
//!
//! Counts the shared [`SimClock`] at 1 MHz divided by the programmed
//! prescaler. The first run lasts `value` ticks (the whole period when
//! `value` is 0); continuous counters then reload with the period.

use std::sync::{Arc, Mutex};

use halcyon_hal::timer::{TimerBackend, TimerError, TimerEvent, TimerSettings, BASE_FREQUENCY_HZ};
use halcyon_hal::Result;

use crate::delay::SimClock;
use crate::lock;

const NS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Default)]
struct CounterModel {
    instance: Option<u8>,
    settings: Option<TimerSettings>,
    /// Counted time before the current run segment
    counted_ns: u64,
    /// Clock reading when the counter was last started
    started_at: Option<u64>,
    /// Terminal counts already reported
    reported: u64,
    irq: TimerEvent,
    captured: bool,
}

impl CounterModel {
    fn tick_ns(settings: &TimerSettings) -> u64 {
        NS_PER_SEC * u64::from(settings.divisor.factor()) / u64::from(BASE_FREQUENCY_HZ)
    }

    fn elapsed_ticks(&self, now: u64) -> u64 {
        let Some(settings) = self.settings else { return 0 };
        let running = self.started_at.map_or(0, |t| now.saturating_sub(t));
        (self.counted_ns + running) / Self::tick_ns(&settings)
    }

    fn first_run(settings: &TimerSettings) -> u64 {
        match settings.config.value {
            0 => u64::from(settings.config.period),
            v => u64::from(v),
        }
    }

    fn expiries(&self, now: u64) -> u64 {
        let Some(settings) = self.settings else { return 0 };
        let elapsed = self.elapsed_ticks(now);
        let first = Self::first_run(&settings);
        if elapsed < first {
            0
        } else if settings.config.is_continuous {
            1 + (elapsed - first) / u64::from(settings.config.period)
        } else {
            1
        }
    }

    fn remaining(&self, now: u64) -> u32 {
        let Some(settings) = self.settings else { return 0 };
        let elapsed = self.elapsed_ticks(now);
        let first = Self::first_run(&settings);
        let period = u64::from(settings.config.period);
        let left = if elapsed < first {
            first - elapsed
        } else if settings.config.is_continuous {
            period - (elapsed - first) % period
        } else {
            0
        };
        u32::try_from(left).unwrap_or(u32::MAX)
    }

    fn pause(&mut self, now: u64) {
        if let Some(t) = self.started_at.take() {
            self.counted_ns += now.saturating_sub(t);
        }
    }

    fn rewind(&mut self) {
        self.counted_ns = 0;
        self.reported = 0;
        self.captured = false;
    }
}

/// Backend for one timer handle
#[derive(Debug, Clone)]
pub struct SimTimer {
    clock: SimClock,
    model: Arc<Mutex<CounterModel>>,
}

impl SimTimer {
    pub fn new(clock: SimClock) -> (Self, TimerProbe) {
        let model = Arc::new(Mutex::new(CounterModel::default()));
        (
            Self {
                clock,
                model: model.clone(),
            },
            TimerProbe { model },
        )
    }
}

impl TimerBackend for SimTimer {
    fn attach(&mut self, instance: u8) -> Result<(), TimerError> {
        lock(&self.model).instance = Some(instance);
        Ok(())
    }

    fn detach(&mut self) {
        *lock(&self.model) = CounterModel::default();
    }

    fn program(&mut self, settings: &TimerSettings) -> Result<(), TimerError> {
        settings.config.validate()?;
        let now = self.clock.now_ns();
        let mut m = lock(&self.model);
        let running = m.started_at.is_some();
        m.settings = Some(*settings);
        m.rewind();
        m.started_at = running.then_some(now);
        Ok(())
    }

    fn start(&mut self) {
        let now = self.clock.now_ns();
        let mut m = lock(&self.model);
        if m.started_at.is_none() {
            m.started_at = Some(now);
        }
    }

    fn stop(&mut self) {
        let now = self.clock.now_ns();
        lock(&self.model).pause(now);
    }

    fn restart(&mut self) {
        let now = self.clock.now_ns();
        let mut m = lock(&self.model);
        m.rewind();
        m.started_at = Some(now);
    }

    fn ticks_to_expiry(&self) -> u32 {
        lock(&self.model).remaining(self.clock.now_ns())
    }

    fn set_interrupts(&mut self, events: TimerEvent, _priority: u8) {
        lock(&self.model).irq = events;
    }

    fn service_interrupt(&mut self) -> TimerEvent {
        let now = self.clock.now_ns();
        let mut m = lock(&self.model);
        let mut raised = TimerEvent::empty();

        let expiries = m.expiries(now);
        if expiries > m.reported {
            m.reported = expiries;
            raised |= TimerEvent::TERMINAL_COUNT;
            // A one-shot counter halts at terminal count
            if m.settings.is_some_and(|s| !s.config.is_continuous) {
                m.pause(now);
            }
        }
        if core::mem::take(&mut m.captured) {
            raised |= TimerEvent::CAPTURE_COMPARE;
        }
        raised & m.irq
    }
}

/// Outside view of the counter
#[derive(Debug, Clone)]
pub struct TimerProbe {
    model: Arc<Mutex<CounterModel>>,
}

impl TimerProbe {
    pub fn instance(&self) -> Option<u8> {
        lock(&self.model).instance
    }

    pub fn settings(&self) -> Option<TimerSettings> {
        lock(&self.model).settings
    }

    pub fn is_counting(&self) -> bool {
        lock(&self.model).started_at.is_some()
    }

    /// Latch a capture/compare match
    pub fn capture(&self) {
        lock(&self.model).captured = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_hal::timer::{CounterWidth, Divisor, TimerConfig};

    fn counter(config: TimerConfig, divisor: Divisor) -> (SimTimer, TimerProbe, SimClock) {
        let clock = SimClock::new();
        let (mut timer, probe) = SimTimer::new(clock.clone());
        timer.attach(0).unwrap();
        timer
            .program(&TimerSettings {
                config,
                divisor,
                width: CounterWidth::Bits32,
            })
            .unwrap();
        timer.set_interrupts(TimerEvent::all(), 0);
        (timer, probe, clock)
    }

    #[test]
    fn test_counts_only_while_started() {
        let (mut timer, _, clock) = counter(TimerConfig::default(), Divisor::Div1);
        clock.advance_ms(10);
        assert_eq!(timer.ticks_to_expiry(), 100_000);

        timer.start();
        clock.advance_ms(10);
        assert_eq!(timer.ticks_to_expiry(), 90_000);

        timer.stop();
        clock.advance_ms(50);
        assert_eq!(timer.ticks_to_expiry(), 90_000);
    }

    #[test]
    fn test_prescaler_slows_count() {
        let (mut timer, _, clock) = counter(TimerConfig::default(), Divisor::Div16);
        timer.start();
        clock.advance_ms(16);
        assert_eq!(timer.ticks_to_expiry(), 99_000);
    }

    #[test]
    fn test_continuous_reports_once_per_batch() {
        let config = TimerConfig {
            period: 1_000,
            ..TimerConfig::default()
        };
        let (mut timer, _, clock) = counter(config, Divisor::Div1);
        timer.start();
        clock.advance_ms(3);
        assert_eq!(timer.service_interrupt(), TimerEvent::TERMINAL_COUNT);
        assert!(timer.service_interrupt().is_empty());
        clock.advance_ms(1);
        assert_eq!(timer.service_interrupt(), TimerEvent::TERMINAL_COUNT);
    }

    #[test]
    fn test_one_shot_halts() {
        let config = TimerConfig {
            is_continuous: false,
            period: 500,
            ..TimerConfig::default()
        };
        let (mut timer, probe, clock) = counter(config, Divisor::Div1);
        timer.start();
        clock.advance_ms(1);
        assert_eq!(timer.service_interrupt(), TimerEvent::TERMINAL_COUNT);
        assert!(!probe.is_counting());
        assert_eq!(timer.ticks_to_expiry(), 0);

        timer.restart();
        assert_eq!(timer.ticks_to_expiry(), 500);
    }

    #[test]
    fn test_capture_is_masked() {
        let (mut timer, probe, _) = counter(TimerConfig::default(), Divisor::Div1);
        timer.set_interrupts(TimerEvent::TERMINAL_COUNT, 0);
        probe.capture();
        assert!(timer.service_interrupt().is_empty());
    }
}
