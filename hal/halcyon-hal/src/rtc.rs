//! Real-time clock
//!
//! The hardware keeps a 32-bit count of seconds since 2010-01-01 00:00:00.
//! This module does the calendar arithmetic on top of it and applies
//! daylight saving time in software: every read and write checks whether
//! the clock crossed a DST boundary and moves the counter by an hour when
//! it did.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::claim::Claim;
use crate::event::{event_flags, EventCore, EventFlags, EventHandler};
use crate::hwmgr::{HwManager, Resource, ResourceType};
use crate::result::{peripheral_error, Result};
use crate::transfer::{Direction, TransferEvent};

/// Year of counter value zero
pub const EPOCH_YEAR: u16 = 2010;
/// Last year the counter can represent in full
pub const MAX_YEAR: u16 = 2136;

const EPOCH_WEEKDAY: u32 = 5;
const SECS_PER_HOUR: u32 = 3_600;
const SECS_PER_DAY: u32 = 86_400;
const CUMULATIVE_DAYS: [u16; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];

const MONTH_SHIFT: u32 = 10;
const DAY_SHIFT: u32 = 5;

peripheral_error! {
    /// RTC status
    pub enum RtcError {
        /// Calendar field out of range
        InvalidTime = 0x10 => InvalidArgument,
        InvalidDstRule = 0x11 => InvalidArgument,
        /// Alarm with no fields to match
        EmptyAlarm = 0x12 => InvalidArgument,
    }
}

pub const fn is_leap_year(year: u16) -> bool {
    year % 400 == 0 || (year % 4 == 0 && year % 100 != 0)
}

/// Days in `month` (1..=12); zero for an invalid month
pub const fn days_in_month(month: u8, year: u16) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

const fn days_in_year(year: u16) -> u32 {
    if is_leap_year(year) {
        366
    } else {
        365
    }
}

/// Zero-based day of the year
fn day_of_year(year: u16, month: u8, day: u8) -> u16 {
    let leap = u16::from(month > 2 && is_leap_year(year));
    CUMULATIVE_DAYS[usize::from(month - 1)] + leap + u16::from(day) - 1
}

fn leap_days_before(year: u16) -> u32 {
    let y = u32::from(year) - 1;
    y / 4 - y / 100 + y / 400
}

fn days_since_epoch(year: u16, month: u8, day: u8) -> u32 {
    (u32::from(year) - u32::from(EPOCH_YEAR)) * 365 + leap_days_before(year)
        - leap_days_before(EPOCH_YEAR)
        + u32::from(day_of_year(year, month, day))
}

/// Day of the week, 0 = Sunday
pub fn weekday(year: u16, month: u8, day: u8) -> u8 {
    ((days_since_epoch(year, month, day) + EPOCH_WEEKDAY) % 7) as u8
}

/// Calendar time
///
/// `weekday` (0 = Sunday) and `yday` (0-based) are filled in on read and
/// ignored on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub weekday: u8,
    pub yday: u16,
}

impl Default for DateTime {
    /// 2011-01-01 00:00:00, the value a fresh clock starts from
    fn default() -> Self {
        Self {
            year: 2011,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
            weekday: 6,
            yday: 0,
        }
    }
}

impl DateTime {
    /// Build a validated time with the derived fields filled in
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Result<Self, RtcError> {
        let mut time = Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
            weekday: 0,
            yday: 0,
        };
        time.validate()?;
        time.weekday = weekday(year, month, day);
        time.yday = day_of_year(year, month, day);
        Ok(time)
    }

    pub fn validate(&self) -> Result<(), RtcError> {
        let valid = (EPOCH_YEAR..=MAX_YEAR).contains(&self.year)
            && (1..=12).contains(&self.month)
            && self.day >= 1
            && self.day <= days_in_month(self.month, self.year)
            && self.hour < 24
            && self.minute < 60
            && self.second < 60;
        if valid {
            Ok(())
        } else {
            Err(RtcError::InvalidTime)
        }
    }

    /// Counter value for this time
    pub fn to_seconds(&self) -> Result<u32, RtcError> {
        self.validate()?;
        let days = u64::from(days_since_epoch(self.year, self.month, self.day));
        let secs = days * u64::from(SECS_PER_DAY)
            + u64::from(self.hour) * u64::from(SECS_PER_HOUR)
            + u64::from(self.minute) * 60
            + u64::from(self.second);
        u32::try_from(secs).map_err(|_| RtcError::InvalidTime)
    }

    pub fn from_seconds(secs: u32) -> Self {
        let mut days = secs / SECS_PER_DAY;
        let rem = secs % SECS_PER_DAY;
        let weekday = ((days + EPOCH_WEEKDAY) % 7) as u8;

        let mut year = EPOCH_YEAR;
        while days >= days_in_year(year) {
            days -= days_in_year(year);
            year += 1;
        }
        let yday = days as u16;

        let mut month = 1;
        while days >= u32::from(days_in_month(month, year)) {
            days -= u32::from(days_in_month(month, year));
            month += 1;
        }

        Self {
            year,
            month,
            day: days as u8 + 1,
            hour: (rem / SECS_PER_HOUR) as u8,
            minute: (rem % SECS_PER_HOUR / 60) as u8,
            second: (rem % 60) as u8,
            weekday,
            yday,
        }
    }

    /// Month, day and hour packed for DST comparison
    fn packed(&self) -> u32 {
        pack(self.month, self.day, self.hour)
    }
}

fn pack(month: u8, day: u8, hour: u8) -> u32 {
    (u32::from(month) << MONTH_SHIFT) | (u32::from(day) << DAY_SHIFT) | u32::from(hour)
}

/// Day a DST boundary falls on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DstDay {
    Fixed { day_of_month: u8 },
    /// `week_of_month` counts from zero; a week past the end of the month
    /// means the last such weekday
    Relative { week_of_month: u8, day_of_week: u8 },
}

/// One DST boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DstRule {
    pub month: u8,
    pub hour: u8,
    pub day: DstDay,
}

impl DstRule {
    pub fn validate(&self) -> Result<(), RtcError> {
        let day_ok = match self.day {
            DstDay::Fixed { day_of_month } => (1..=31).contains(&day_of_month),
            DstDay::Relative {
                week_of_month,
                day_of_week,
            } => week_of_month <= 5 && day_of_week <= 6,
        };
        if (1..=12).contains(&self.month) && self.hour < 24 && day_ok {
            Ok(())
        } else {
            Err(RtcError::InvalidDstRule)
        }
    }

    /// Day of the month this rule lands on in `year`
    pub fn day_in(&self, year: u16) -> u8 {
        match self.day {
            DstDay::Fixed { day_of_month } => day_of_month,
            DstDay::Relative {
                week_of_month,
                day_of_week,
            } => {
                let first = weekday(year, self.month, 1);
                let offset = (day_of_week + 7 - first) % 7;
                let mut day = 1 + offset + 7 * week_of_month;
                let last = days_in_month(self.month, year);
                while day > last && day > 7 {
                    day -= 7;
                }
                day
            }
        }
    }

    fn packed(&self, year: u16) -> u32 {
        pack(self.month, self.day_in(year), self.hour)
    }
}

/// Whether `now` falls inside the DST window
///
/// The hour right before `stop` reads as standard time: after falling back
/// it is the repeated hour.
pub fn dst_status(start: &DstRule, stop: &DstRule, now: &DateTime) -> bool {
    let start = start.packed(now.year);
    let stop = stop.packed(now.year);
    let now = now.packed();
    start <= now && now < stop && stop - now != 1
}

#[derive(Debug, Clone, Copy)]
struct DstState {
    start: DstRule,
    stop: DstRule,
    active: bool,
    /// Clock as last observed, local time
    last: DateTime,
}

impl DstState {
    /// Seed from a clock reading without shifting it
    fn seeded(start: DstRule, stop: DstRule, now: DateTime) -> Self {
        Self {
            start,
            stop,
            active: dst_status(&start, &stop, &now),
            last: now,
        }
    }

    /// Whether the start boundary lies between the last reading and `now`
    ///
    /// A reading from an earlier year counts as before the boundary.
    fn crossed_start(&self, now: &DateTime) -> bool {
        let start = self.start.packed(now.year);
        let before = self.last.year < now.year || self.last.packed() < start;
        before && start <= now.packed()
    }
}

bitflags::bitflags! {
    /// Fields an alarm compares
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct AlarmMatch: u8 {
        const SECOND = 1 << 0;
        const MINUTE = 1 << 1;
        const HOUR = 1 << 2;
        const DAY = 1 << 3;
        const MONTH = 1 << 4;
    }
}

/// Programmed alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alarm {
    pub time: DateTime,
    pub matches: AlarmMatch,
}

impl Alarm {
    /// Whether the alarm fires at `now`
    pub fn matches(&self, now: &DateTime) -> bool {
        let field = |flag: AlarmMatch, a: u8, b: u8| !self.matches.contains(flag) || a == b;
        field(AlarmMatch::SECOND, self.time.second, now.second)
            && field(AlarmMatch::MINUTE, self.time.minute, now.minute)
            && field(AlarmMatch::HOUR, self.time.hour, now.hour)
            && field(AlarmMatch::DAY, self.time.day, now.day)
            && field(AlarmMatch::MONTH, self.time.month, now.month)
    }
}

event_flags! {
    /// RTC interrupt conditions
    pub struct RtcEvent: u32 {
        const ALARM = 1 << 0;
    }
}

impl EventFlags for RtcEvent {
    fn completion(_direction: Direction, _outcome: &TransferEvent) -> Self {
        RtcEvent::empty()
    }
}

/// Register glue for the seconds counter
pub trait RtcBackend {
    fn seconds(&self) -> u32;

    fn set_seconds(&mut self, secs: u32);

    /// Retained flag set once software has written the time
    fn time_valid(&self) -> bool;

    fn mark_time_valid(&mut self);

    fn set_alarm(&mut self, alarm: Option<Alarm>);

    fn set_interrupts(&mut self, events: RtcEvent, priority: u8);

    /// Read and clear pending conditions
    fn service_interrupt(&mut self) -> RtcEvent;
}

struct State<B> {
    backend: B,
    dst: Option<DstState>,
}

impl<B: RtcBackend> State<B> {
    /// Apply a DST transition observed since the last reading and return
    /// the current counter
    ///
    /// The clock only moves when a boundary was crossed between two
    /// readings; a time written inside the window is taken as local time.
    fn sync_dst(&mut self) -> u32 {
        let now = self.backend.seconds();
        let Some(dst) = self.dst.as_mut() else {
            return now;
        };
        let time = DateTime::from_seconds(now);
        let status = dst_status(&dst.start, &dst.stop, &time);

        let secs = if status && !dst.active && dst.crossed_start(&time) {
            let shifted = now.saturating_add(SECS_PER_HOUR);
            self.backend.set_seconds(shifted);
            dst.active = true;
            debug!("rtc: entered dst");
            shifted
        } else if !status && dst.active {
            let shifted = now.saturating_sub(SECS_PER_HOUR);
            self.backend.set_seconds(shifted);
            dst.active = false;
            debug!("rtc: left dst");
            shifted
        } else {
            now
        };
        dst.last = DateTime::from_seconds(secs);
        secs
    }
}

/// The claimed real-time clock
pub struct Rtc<'a, B: RtcBackend> {
    claim: Claim<'a>,
    state: Mutex<CriticalSectionRawMutex, RefCell<State<B>>>,
    events: EventCore<RtcEvent>,
}

impl<'a, B: RtcBackend> Rtc<'a, B> {
    /// Claim the clock
    ///
    /// A counter that was never written starts at [`DateTime::default`].
    /// A running clock keeps its time.
    pub fn init(hw: &'a HwManager, mut backend: B) -> Result<Self> {
        let claim = Claim::acquire(hw, &[Resource::block(ResourceType::Rtc, 0)])?;
        if !backend.time_valid() {
            backend.set_seconds(DateTime::default().to_seconds()?);
            debug!("rtc: counter reset to default time");
        }
        Ok(Self {
            claim,
            state: Mutex::new(RefCell::new(State { backend, dst: None })),
            events: EventCore::new(),
        })
    }

    /// Release the clock; the counter keeps running
    pub fn free(&self) -> Result<()> {
        self.claim.check::<RtcError>()?;
        self.events.clear();
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_interrupts(RtcEvent::empty(), 0);
            s.backend.set_alarm(None);
            s.dst = None;
        });
        self.claim.release();
        Ok(())
    }

    /// True once the time has been written
    pub fn is_enabled(&self) -> Result<bool> {
        self.claim.check::<RtcError>()?;
        Ok(self.state.lock(|s| s.borrow().backend.time_valid()))
    }

    pub fn read(&self) -> Result<DateTime> {
        self.claim.check::<RtcError>()?;
        let secs = self.state.lock(|s| s.borrow_mut().sync_dst());
        Ok(DateTime::from_seconds(secs))
    }

    /// Set the local time; `weekday` and `yday` are ignored
    ///
    /// With DST rules installed a time inside the window is taken as
    /// daylight time and is not shifted.
    pub fn write(&self, time: &DateTime) -> Result<()> {
        self.claim.check::<RtcError>()?;
        let secs = time.to_seconds()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_seconds(secs);
            s.backend.mark_time_valid();
            if let Some(dst) = s.dst.as_mut() {
                *dst = DstState::seeded(dst.start, dst.stop, DateTime::from_seconds(secs));
            }
        });
        Ok(())
    }

    /// Set the time from individual fields; `month` is 1-based
    pub fn write_direct(&self, second: u8, minute: u8, hour: u8, day: u8, month: u8, year: u16) -> Result<()> {
        let time = DateTime::new(year, month, day, hour, minute, second)?;
        self.write(&time)
    }

    /// Install DST boundaries
    ///
    /// The current state is taken from the clock as it reads now, without
    /// shifting it.
    pub fn set_dst(&self, start: DstRule, stop: DstRule) -> Result<()> {
        self.claim.check::<RtcError>()?;
        start.validate()?;
        stop.validate()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let now = DateTime::from_seconds(s.backend.seconds());
            s.dst = Some(DstState::seeded(start, stop, now));
        });
        Ok(())
    }

    pub fn is_dst(&self) -> Result<bool> {
        self.claim.check::<RtcError>()?;
        Ok(self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.sync_dst();
            s.dst.is_some_and(|d| d.active)
        }))
    }

    /// Program an alarm on the fields named by `matches`
    pub fn set_alarm(&self, time: &DateTime, matches: AlarmMatch) -> Result<()> {
        self.claim.check::<RtcError>()?;
        if matches.is_empty() {
            return Err(RtcError::EmptyAlarm.into());
        }
        time.validate()?;
        self.state.lock(|s| {
            s.borrow_mut().backend.set_alarm(Some(Alarm {
                time: *time,
                matches,
            }))
        });
        Ok(())
    }

    /// Alarm `seconds` from now
    pub fn set_alarm_by_seconds(&self, seconds: u32) -> Result<()> {
        self.claim.check::<RtcError>()?;
        let now = self.state.lock(|s| s.borrow_mut().sync_dst());
        let target = now.checked_add(seconds).ok_or(RtcError::InvalidTime)?;
        let time = DateTime::from_seconds(target);
        time.validate()?;
        self.set_alarm(&time, AlarmMatch::all())
    }

    pub fn register_callback(&self, handler: Option<&'static dyn EventHandler<RtcEvent>>) -> Result<()> {
        self.claim.check::<RtcError>()?;
        self.events.register(handler);
        Ok(())
    }

    pub fn enable_event(&self, event: RtcEvent, priority: u8, enable: bool) -> Result<()> {
        self.claim.check::<RtcError>()?;
        self.events.enable(event, priority, enable);
        let enabled = self.events.enabled();
        self.state.lock(|s| {
            s.borrow_mut()
                .backend
                .set_interrupts(enabled, self.events.priority())
        });
        Ok(())
    }

    pub fn on_interrupt(&self) {
        if !self.claim.is_live() {
            return;
        }
        let raised = self.state.lock(|s| s.borrow_mut().backend.service_interrupt());
        self.events.raise(raised);
    }

    /// Direct access to the register glue
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut().backend))
    }
}

impl<B: RtcBackend> Drop for Rtc<'_, B> {
    fn drop(&mut self) {
        let _ = self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{Error, StatusCode};
    use portable_atomic::{AtomicU32, Ordering};
    use proptest::prelude::*;

    #[derive(Default)]
    struct MockClock {
        secs: u32,
        valid: bool,
        alarm: Option<Alarm>,
        irq: RtcEvent,
    }

    impl MockClock {
        fn tick(&mut self, secs: u32) -> RtcEvent {
            self.secs += secs;
            match self.alarm {
                Some(alarm) if alarm.matches(&DateTime::from_seconds(self.secs)) => RtcEvent::ALARM,
                _ => RtcEvent::empty(),
            }
        }
    }

    impl RtcBackend for MockClock {
        fn seconds(&self) -> u32 {
            self.secs
        }

        fn set_seconds(&mut self, secs: u32) {
            self.secs = secs;
        }

        fn time_valid(&self) -> bool {
            self.valid
        }

        fn mark_time_valid(&mut self) {
            self.valid = true;
        }

        fn set_alarm(&mut self, alarm: Option<Alarm>) {
            self.alarm = alarm;
        }

        fn set_interrupts(&mut self, events: RtcEvent, _priority: u8) {
            self.irq = events;
        }

        fn service_interrupt(&mut self) -> RtcEvent {
            self.tick(0)
        }
    }

    fn us_rules() -> (DstRule, DstRule) {
        // Second Sunday of March at 02:00, first Sunday of November at 02:00
        let start = DstRule {
            month: 3,
            hour: 2,
            day: DstDay::Relative {
                week_of_month: 1,
                day_of_week: 0,
            },
        };
        let stop = DstRule {
            month: 11,
            hour: 2,
            day: DstDay::Relative {
                week_of_month: 0,
                day_of_week: 0,
            },
        };
        (start, stop)
    }

    #[test]
    fn test_leap_years() {
        assert!(is_leap_year(2012));
        assert!(!is_leap_year(2100));
        assert!(is_leap_year(2000));
        assert_eq!(days_in_month(2, 2024), 29);
        assert_eq!(days_in_month(2, 2023), 28);
        assert_eq!(days_in_month(13, 2023), 0);
    }

    #[test]
    fn test_known_weekdays() {
        assert_eq!(weekday(2010, 1, 1), 5);
        assert_eq!(weekday(2011, 1, 1), 6);
        assert_eq!(weekday(2024, 3, 10), 0);
        assert_eq!(weekday(2100, 3, 1), 1);
    }

    #[test]
    fn test_seconds_conversion() {
        assert_eq!(DateTime::from_seconds(0).year, 2010);
        let default = DateTime::default();
        assert_eq!(default.to_seconds().unwrap(), 365 * SECS_PER_DAY);
        assert_eq!(DateTime::from_seconds(365 * SECS_PER_DAY), default);

        let leap = DateTime::new(2012, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(leap.yday, 365);
        let back = DateTime::from_seconds(leap.to_seconds().unwrap());
        assert_eq!(back, leap);

        let last = DateTime::new(MAX_YEAR, 12, 31, 23, 59, 59).unwrap();
        assert!(last.to_seconds().is_ok());
    }

    #[test]
    fn test_validation() {
        assert_eq!(DateTime::new(2009, 12, 31, 0, 0, 0), Err(RtcError::InvalidTime));
        assert_eq!(DateTime::new(2137, 1, 1, 0, 0, 0), Err(RtcError::InvalidTime));
        assert_eq!(DateTime::new(2023, 2, 29, 0, 0, 0), Err(RtcError::InvalidTime));
        assert_eq!(DateTime::new(2024, 13, 1, 0, 0, 0), Err(RtcError::InvalidTime));
        assert_eq!(DateTime::new(2024, 1, 1, 24, 0, 0), Err(RtcError::InvalidTime));
        assert!(DateTime::new(2024, 2, 29, 12, 30, 0).is_ok());
    }

    #[test]
    fn test_relative_rules() {
        let (start, stop) = us_rules();
        assert_eq!(start.day_in(2024), 10);
        assert_eq!(stop.day_in(2024), 3);

        let last_sunday = DstRule {
            month: 3,
            hour: 1,
            day: DstDay::Relative {
                week_of_month: 5,
                day_of_week: 0,
            },
        };
        assert_eq!(last_sunday.day_in(2024), 31);
        assert_eq!(last_sunday.day_in(2023), 26);
    }

    #[test]
    fn test_dst_window() {
        let (start, stop) = us_rules();
        let at = |m, d, h| DateTime::new(2024, m, d, h, 0, 0).unwrap();
        assert!(!dst_status(&start, &stop, &at(3, 10, 1)));
        assert!(dst_status(&start, &stop, &at(3, 10, 2)));
        assert!(dst_status(&start, &stop, &at(7, 4, 12)));
        assert!(dst_status(&start, &stop, &at(11, 3, 0)));
        // Repeated hour
        assert!(!dst_status(&start, &stop, &at(11, 3, 1)));
        assert!(!dst_status(&start, &stop, &at(11, 3, 2)));
    }

    #[test]
    fn test_init_keeps_running_clock() {
        let hw = HwManager::new_default();
        let rtc = Rtc::init(&hw, MockClock::default()).unwrap();
        assert!(!rtc.is_enabled().unwrap());
        assert_eq!(rtc.read().unwrap(), DateTime::default());
        drop(rtc);

        let clock = MockClock {
            secs: 1_000_000,
            valid: true,
            ..MockClock::default()
        };
        let rtc = Rtc::init(&hw, clock).unwrap();
        assert!(rtc.is_enabled().unwrap());
        assert_eq!(rtc.read().unwrap(), DateTime::from_seconds(1_000_000));

        let err = Rtc::init(&hw, MockClock::default()).err().unwrap();
        assert_eq!(err.status(), StatusCode::InUse);
    }

    #[test]
    fn test_write_and_read() {
        let hw = HwManager::new_default();
        let rtc = Rtc::init(&hw, MockClock::default()).unwrap();
        rtc.write_direct(30, 15, 9, 29, 2, 2024).unwrap();
        assert!(rtc.is_enabled().unwrap());

        let now = rtc.read().unwrap();
        assert_eq!((now.year, now.month, now.day), (2024, 2, 29));
        assert_eq!((now.hour, now.minute, now.second), (9, 15, 30));
        assert_eq!(now.weekday, 4);
        assert_eq!(now.yday, 59);

        let bad = DateTime {
            month: 0,
            ..now
        };
        assert_eq!(rtc.write(&bad), Err(Error::Rtc(RtcError::InvalidTime)));
        assert_eq!(rtc.read().unwrap(), now);
    }

    #[test]
    fn test_dst_transitions_shift_clock() {
        let hw = HwManager::new_default();
        let rtc = Rtc::init(&hw, MockClock::default()).unwrap();
        let (start, stop) = us_rules();
        rtc.write_direct(59, 59, 1, 10, 3, 2024).unwrap();
        rtc.set_dst(start, stop).unwrap();
        assert!(!rtc.is_dst().unwrap());

        rtc.with_backend(|b| b.tick(1));
        let now = rtc.read().unwrap();
        assert_eq!((now.hour, now.minute), (3, 0));
        assert!(rtc.is_dst().unwrap());

        // 01:00 on the stop day reads as standard time
        rtc.with_backend(|b| {
            let t = DateTime::new(2024, 11, 3, 0, 59, 59).unwrap();
            b.secs = t.to_seconds().unwrap();
            b.tick(1);
        });
        let now = rtc.read().unwrap();
        assert_eq!((now.day, now.hour, now.minute), (3, 0, 0));
        assert!(!rtc.is_dst().unwrap());

        // The repeated hour does not re-enter DST
        rtc.with_backend(|b| b.tick(1_800));
        assert!(!rtc.is_dst().unwrap());
        assert_eq!(rtc.read().unwrap().hour, 0);
    }

    #[test]
    fn test_write_inside_dst_reads_back_unchanged() {
        let hw = HwManager::new_default();
        let rtc = Rtc::init(&hw, MockClock::default()).unwrap();
        let (start, stop) = us_rules();
        rtc.set_dst(start, stop).unwrap();

        rtc.write_direct(0, 0, 12, 4, 7, 2024).unwrap();
        let now = rtc.read().unwrap();
        assert_eq!((now.month, now.day, now.hour, now.minute), (7, 4, 12, 0));
        assert!(rtc.is_dst().unwrap());

        rtc.with_backend(|b| b.tick(600));
        assert_eq!(rtc.read().unwrap().hour, 12);
    }

    #[test]
    fn test_set_dst_inside_window_does_not_shift() {
        let hw = HwManager::new_default();
        let rtc = Rtc::init(&hw, MockClock::default()).unwrap();
        rtc.write_direct(0, 30, 9, 1, 8, 2024).unwrap();
        let (start, stop) = us_rules();
        rtc.set_dst(start, stop).unwrap();
        assert!(rtc.is_dst().unwrap());
        assert_eq!(rtc.read().unwrap().hour, 9);
    }

    #[test]
    fn test_dst_entered_again_next_year() {
        let hw = HwManager::new_default();
        let rtc = Rtc::init(&hw, MockClock::default()).unwrap();
        let (start, stop) = us_rules();
        rtc.write_direct(0, 0, 12, 31, 12, 2024).unwrap();
        rtc.set_dst(start, stop).unwrap();
        rtc.read().unwrap();

        // 2025 starts DST on March 9
        rtc.with_backend(|b| {
            b.secs = DateTime::new(2025, 3, 9, 1, 59, 59).unwrap().to_seconds().unwrap();
            b.tick(1);
        });
        let now = rtc.read().unwrap();
        assert_eq!((now.year, now.hour), (2025, 3));
        assert!(rtc.is_dst().unwrap());
    }

    #[test]
    fn test_invalid_dst_rule() {
        let hw = HwManager::new_default();
        let rtc = Rtc::init(&hw, MockClock::default()).unwrap();
        let (start, mut stop) = us_rules();
        stop.month = 13;
        assert_eq!(rtc.set_dst(start, stop), Err(Error::Rtc(RtcError::InvalidDstRule)));
        assert!(!rtc.is_dst().unwrap());
    }

    #[test]
    fn test_alarm_by_seconds() {
        static ALARMS: AtomicU32 = AtomicU32::new(0);
        fn on_alarm(note: crate::event::Notification<RtcEvent>) {
            if note.events.contains(RtcEvent::ALARM) {
                ALARMS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hw = HwManager::new_default();
        let rtc = Rtc::init(&hw, MockClock::default()).unwrap();
        rtc.register_callback(Some(&on_alarm)).unwrap();
        rtc.enable_event(RtcEvent::ALARM, 1, true).unwrap();
        rtc.set_alarm_by_seconds(90).unwrap();

        let alarm = rtc.with_backend(|b| b.alarm).unwrap();
        assert_eq!(alarm.matches, AlarmMatch::all());
        assert_eq!((alarm.time.minute, alarm.time.second), (1, 30));

        rtc.with_backend(|b| b.tick(89));
        rtc.on_interrupt();
        assert_eq!(ALARMS.load(Ordering::SeqCst), 0);
        rtc.with_backend(|b| b.tick(1));
        rtc.on_interrupt();
        assert_eq!(ALARMS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_alarm_rejected() {
        let hw = HwManager::new_default();
        let rtc = Rtc::init(&hw, MockClock::default()).unwrap();
        assert_eq!(
            rtc.set_alarm(&DateTime::default(), AlarmMatch::empty()),
            Err(Error::Rtc(RtcError::EmptyAlarm))
        );
    }

    #[test]
    fn test_free_keeps_time_running() {
        let hw = HwManager::new_default();
        let rtc = Rtc::init(&hw, MockClock::default()).unwrap();
        rtc.set_alarm_by_seconds(5).unwrap();
        rtc.free().unwrap();
        assert!(rtc.with_backend(|b| b.alarm.is_none()));
        assert_eq!(rtc.read(), Err(Error::Rtc(RtcError::NotInitialized)));
        assert_eq!(rtc.free(), Err(Error::Rtc(RtcError::NotInitialized)));
    }

    proptest! {
        #[test]
        fn prop_calendar_fields_consistent(secs in 0u32..=4_000_000_000) {
            let time = DateTime::from_seconds(secs);
            prop_assert!(time.validate().is_ok());
            prop_assert_eq!(time.to_seconds().unwrap(), secs);
            prop_assert_eq!(time.weekday, weekday(time.year, time.month, time.day));
            prop_assert_eq!(time.yday, day_of_year(time.year, time.month, time.day));
        }
    }
}
