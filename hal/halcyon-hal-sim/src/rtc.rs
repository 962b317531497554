//! Simulated real-time clock
//!
//! A seconds counter that runs off the shared [`SimClock`]. The counter
//! and its valid flag survive handles being dropped, the way a
//! battery-backed domain survives a reset.

use std::sync::{Arc, Mutex};

use halcyon_hal::rtc::{Alarm, DateTime, RtcBackend, RtcEvent};

use crate::delay::SimClock;
use crate::lock;

const NS_PER_SEC: u64 = 1_000_000_000;

/// How far back an interrupt looks for a missed alarm match
const ALARM_LOOKBACK_SECS: u32 = 86_400;

#[derive(Debug, Default)]
struct ClockModel {
    /// Counter value at `base_ns`
    base: u32,
    base_ns: u64,
    valid: bool,
    alarm: Option<Alarm>,
    /// Last second checked against the alarm
    checked: Option<u32>,
    irq: RtcEvent,
}

impl ClockModel {
    fn seconds(&self, now: u64) -> u32 {
        let elapsed = now.saturating_sub(self.base_ns) / NS_PER_SEC;
        self.base
            .saturating_add(u32::try_from(elapsed).unwrap_or(u32::MAX))
    }
}

/// Backend for the RTC handle
#[derive(Debug, Clone)]
pub struct SimRtc {
    clock: SimClock,
    model: Arc<Mutex<ClockModel>>,
}

impl SimRtc {
    pub fn new(clock: SimClock) -> (Self, RtcProbe) {
        let model = Arc::new(Mutex::new(ClockModel::default()));
        (
            Self {
                clock,
                model: model.clone(),
            },
            RtcProbe { model },
        )
    }
}

impl RtcBackend for SimRtc {
    fn seconds(&self) -> u32 {
        lock(&self.model).seconds(self.clock.now_ns())
    }

    fn set_seconds(&mut self, secs: u32) {
        let now = self.clock.now_ns();
        let mut m = lock(&self.model);
        m.base = secs;
        m.base_ns = now;
        m.checked = Some(secs.saturating_sub(1));
    }

    fn time_valid(&self) -> bool {
        lock(&self.model).valid
    }

    fn mark_time_valid(&mut self) {
        lock(&self.model).valid = true;
    }

    fn set_alarm(&mut self, alarm: Option<Alarm>) {
        let now = self.clock.now_ns();
        let mut m = lock(&self.model);
        m.alarm = alarm;
        // Only seconds from now on can match
        let current = m.seconds(now);
        m.checked = Some(current.saturating_sub(1));
    }

    fn set_interrupts(&mut self, events: RtcEvent, _priority: u8) {
        lock(&self.model).irq = events;
    }

    fn service_interrupt(&mut self) -> RtcEvent {
        let now = self.clock.now_ns();
        let mut m = lock(&self.model);
        let current = m.seconds(now);
        let Some(alarm) = m.alarm else {
            m.checked = Some(current);
            return RtcEvent::empty();
        };

        let floor = current.saturating_sub(ALARM_LOOKBACK_SECS);
        let from = m.checked.map_or(floor, |c| c.saturating_add(1).max(floor));
        m.checked = Some(current);
        let hit = (from..=current).any(|s| alarm.matches(&DateTime::from_seconds(s)));
        if hit {
            RtcEvent::ALARM & m.irq
        } else {
            RtcEvent::empty()
        }
    }
}

/// Outside view of the clock domain
#[derive(Debug, Clone)]
pub struct RtcProbe {
    model: Arc<Mutex<ClockModel>>,
}

impl RtcProbe {
    /// Lose backup power: the time is no longer valid
    pub fn power_loss(&self) {
        let mut m = lock(&self.model);
        m.valid = false;
        m.alarm = None;
    }

    pub fn alarm(&self) -> Option<Alarm> {
        lock(&self.model).alarm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_hal::rtc::AlarmMatch;

    #[test]
    fn test_counter_follows_clock() {
        let clock = SimClock::new();
        let (mut rtc, _) = SimRtc::new(clock.clone());
        rtc.set_seconds(1_000);
        clock.advance_ms(2_500);
        assert_eq!(rtc.seconds(), 1_002);
    }

    #[test]
    fn test_alarm_fires_once() {
        let clock = SimClock::new();
        let (mut rtc, _) = SimRtc::new(clock.clone());
        let start = DateTime::new(2024, 6, 1, 12, 0, 0).unwrap();
        rtc.set_seconds(start.to_seconds().unwrap());
        rtc.set_interrupts(RtcEvent::ALARM, 0);
        rtc.set_alarm(Some(Alarm {
            time: DateTime::new(2024, 6, 1, 12, 0, 30).unwrap(),
            matches: AlarmMatch::SECOND | AlarmMatch::MINUTE,
        }));

        clock.advance_secs(10);
        assert!(rtc.service_interrupt().is_empty());
        clock.advance_secs(25);
        assert_eq!(rtc.service_interrupt(), RtcEvent::ALARM);
        assert!(rtc.service_interrupt().is_empty());
    }

    #[test]
    fn test_power_loss_clears_valid() {
        let clock = SimClock::new();
        let (mut rtc, probe) = SimRtc::new(clock);
        rtc.mark_time_valid();
        assert!(rtc.time_valid());
        probe.power_loss();
        assert!(!rtc.time_valid());
    }
}
