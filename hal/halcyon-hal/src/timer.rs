//! Timer driver
//!
//! Two auxiliary down-counters clocked from a 1 MHz base through a
//! prescaler of 1, 16 or 256.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::claim::Claim;
use crate::event::{event_flags, EventCore, EventFlags, EventHandler};
use crate::hwmgr::{HwManager, HwmgrError, Resource, ResourceType};
use crate::result::{peripheral_error, Result};
use crate::transfer::{Direction, TransferEvent};

/// Counter clock before the prescaler
pub const BASE_FREQUENCY_HZ: u32 = 1_000_000;

peripheral_error! {
    /// Timer status
    pub enum TimerError {
        /// Not within 2% of a prescaled base clock
        InvalidFrequency = 0x10 => InvalidArgument,
        InvalidPeriod = 0x11 => InvalidArgument,
        /// Compare value above the period
        InvalidCompare = 0x12 => InvalidArgument,
        /// Initial value above the period
        InvalidValue = 0x13 => InvalidArgument,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CountDirection {
    Up,
    Down,
    UpDown,
}

/// Base clock prescaler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Divisor {
    Div1,
    Div16,
    Div256,
}

impl Divisor {
    pub const ALL: [Divisor; 3] = [Divisor::Div1, Divisor::Div16, Divisor::Div256];

    pub const fn factor(self) -> u32 {
        match self {
            Divisor::Div1 => 1,
            Divisor::Div16 => 16,
            Divisor::Div256 => 256,
        }
    }

    /// Nominal counter clock, truncated
    pub const fn frequency(self) -> u32 {
        BASE_FREQUENCY_HZ / self.factor()
    }

    /// Prescaler whose clock is within 2% of `hz`
    pub fn for_frequency(hz: u32) -> Option<Self> {
        let hz = u64::from(hz) * 100;
        Self::ALL.into_iter().find(|d| {
            let nominal = u64::from(d.frequency());
            hz >= nominal * 98 && hz <= nominal * 102
        })
    }
}

/// Counter register width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CounterWidth {
    Bits16,
    Bits32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TimerConfig {
    /// Reload at terminal count instead of stopping
    pub is_continuous: bool,
    pub direction: CountDirection,
    pub is_compare: bool,
    /// Ticks per run
    pub period: u32,
    pub compare_value: u32,
    /// Initial count
    pub value: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            is_continuous: true,
            direction: CountDirection::Down,
            is_compare: false,
            period: 100_000,
            compare_value: 0,
            value: 0,
        }
    }
}

impl TimerConfig {
    pub fn validate(&self) -> Result<(), TimerError> {
        if self.direction == CountDirection::UpDown {
            return Err(TimerError::Unsupported);
        }
        if self.period == 0 {
            return Err(TimerError::InvalidPeriod);
        }
        if self.compare_value > self.period {
            return Err(TimerError::InvalidCompare);
        }
        if self.value > self.period {
            return Err(TimerError::InvalidValue);
        }
        Ok(())
    }

    /// Narrowest counter that holds the period
    pub fn width(&self) -> CounterWidth {
        if self.period >= 0xFFFF {
            CounterWidth::Bits32
        } else {
            CounterWidth::Bits16
        }
    }
}

/// Everything the backend programs into one counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerSettings {
    pub config: TimerConfig,
    pub divisor: Divisor,
    pub width: CounterWidth,
}

event_flags! {
    /// Timer interrupt conditions
    pub struct TimerEvent: u32 {
        const TERMINAL_COUNT = 1 << 0;
        const CAPTURE_COMPARE = 1 << 1;
    }
}

impl EventFlags for TimerEvent {
    fn completion(_direction: Direction, _outcome: &TransferEvent) -> Self {
        TimerEvent::empty()
    }
}

/// Register glue for one auxiliary timer
pub trait TimerBackend {
    /// Bind to counter `instance`
    fn attach(&mut self, instance: u8) -> Result<(), TimerError>;

    fn detach(&mut self);

    /// Load settings; a running counter picks them up on the next reload
    fn program(&mut self, settings: &TimerSettings) -> Result<(), TimerError>;

    fn start(&mut self);

    fn stop(&mut self);

    /// Reload the counter from its initial value and run
    fn restart(&mut self);

    /// Counter ticks left before terminal count
    fn ticks_to_expiry(&self) -> u32;

    fn set_interrupts(&mut self, events: TimerEvent, priority: u8);

    /// Read and clear pending conditions
    fn service_interrupt(&mut self) -> TimerEvent;
}

struct State<B> {
    backend: B,
    config: TimerConfig,
    divisor: Divisor,
    running: bool,
}

impl<B: TimerBackend> State<B> {
    fn program(&mut self, config: TimerConfig, divisor: Divisor) -> Result<(), TimerError> {
        config.validate()?;
        self.backend.program(&TimerSettings {
            config,
            divisor,
            width: config.width(),
        })?;
        self.config = config;
        self.divisor = divisor;
        Ok(())
    }
}

/// A claimed auxiliary timer
pub struct Timer<'a, B: TimerBackend> {
    claim: Claim<'a>,
    instance: u8,
    state: Mutex<CriticalSectionRawMutex, RefCell<State<B>>>,
    events: EventCore<TimerEvent>,
}

impl<'a, B: TimerBackend> Timer<'a, B> {
    /// Claim timer `instance`, or the first free one for `None`
    ///
    /// The timer starts stopped with the default configuration and an
    /// undivided 1 MHz clock.
    pub fn init(hw: &'a HwManager, mut backend: B, instance: Option<u8>) -> Result<Self> {
        let claim = match instance {
            Some(n) => Claim::acquire(hw, &[Resource::block(ResourceType::T2Timer, n)])?,
            None => Claim::allocate(hw, ResourceType::T2Timer)?,
        };
        let instance = claim
            .primary()
            .map(|r| r.block)
            .ok_or(HwmgrError::InvalidResource)?;

        backend.attach(instance)?;
        let mut state = State {
            backend,
            config: TimerConfig::default(),
            divisor: Divisor::Div1,
            running: false,
        };
        if let Err(e) = state.program(TimerConfig::default(), Divisor::Div1) {
            state.backend.detach();
            return Err(e.into());
        }
        debug!("timer{}: claimed", instance);

        Ok(Self {
            claim,
            instance,
            state: Mutex::new(RefCell::new(state)),
            events: EventCore::new(),
        })
    }

    pub fn free(&self) -> Result<()> {
        self.claim.check::<TimerError>()?;
        self.events.clear();
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_interrupts(TimerEvent::empty(), 0);
            s.backend.stop();
            s.backend.detach();
            s.running = false;
        });
        self.claim.release();
        debug!("timer{}: freed", self.instance);
        Ok(())
    }

    pub fn instance(&self) -> u8 {
        self.instance
    }

    pub fn config(&self) -> Result<TimerConfig> {
        self.claim.check::<TimerError>()?;
        Ok(self.state.lock(|s| s.borrow().config))
    }

    pub fn divisor(&self) -> Result<Divisor> {
        self.claim.check::<TimerError>()?;
        Ok(self.state.lock(|s| s.borrow().divisor))
    }

    /// Replace the counter configuration; the old one stays on error
    pub fn configure(&self, config: TimerConfig) -> Result<()> {
        self.claim.check::<TimerError>()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let divisor = s.divisor;
            s.program(config, divisor)
        })?;
        Ok(())
    }

    /// Pick the prescaler matching `hz`
    ///
    /// Accepts 1 MHz, 62.5 kHz and 3906 Hz, each within 2%.
    pub fn set_frequency(&self, hz: u32) -> Result<()> {
        self.claim.check::<TimerError>()?;
        let Some(divisor) = Divisor::for_frequency(hz) else {
            warn!("timer{}: no prescaler for {} Hz", self.instance, hz);
            return Err(TimerError::InvalidFrequency.into());
        };
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let config = s.config;
            s.program(config, divisor)
        })?;
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.claim.check::<TimerError>()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.start();
            s.running = true;
        });
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.claim.check::<TimerError>()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.stop();
            s.running = false;
        });
        Ok(())
    }

    /// Reload from the initial value and run
    pub fn reset(&self) -> Result<()> {
        self.claim.check::<TimerError>()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.restart();
            s.running = true;
        });
        Ok(())
    }

    pub fn is_running(&self) -> Result<bool> {
        self.claim.check::<TimerError>()?;
        Ok(self.state.lock(|s| s.borrow().running))
    }

    /// Base-clock ticks until terminal count
    pub fn read(&self) -> Result<u32> {
        self.claim.check::<TimerError>()?;
        Ok(self.state.lock(|s| {
            let s = s.borrow();
            s.backend
                .ticks_to_expiry()
                .saturating_mul(s.divisor.factor())
        }))
    }

    pub fn register_callback(&self, handler: Option<&'static dyn EventHandler<TimerEvent>>) -> Result<()> {
        self.claim.check::<TimerError>()?;
        self.events.register(handler);
        Ok(())
    }

    pub fn enable_event(&self, event: TimerEvent, priority: u8, enable: bool) -> Result<()> {
        self.claim.check::<TimerError>()?;
        self.events.enable(event, priority, enable);
        let enabled = self.events.enabled();
        self.state.lock(|s| {
            s.borrow_mut()
                .backend
                .set_interrupts(enabled, self.events.priority())
        });
        Ok(())
    }

    /// Interrupt entry point for this counter
    pub fn on_interrupt(&self) {
        if !self.claim.is_live() {
            return;
        }
        let raised = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let raised = s.backend.service_interrupt();
            if raised.contains(TimerEvent::TERMINAL_COUNT) && !s.config.is_continuous {
                s.running = false;
            }
            raised
        });
        self.events.raise(raised);
    }

    /// Direct access to the register glue
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut().backend))
    }
}

impl<B: TimerBackend> Drop for Timer<'_, B> {
    fn drop(&mut self) {
        let _ = self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Notification;
    use crate::result::{Error, StatusCode};
    use portable_atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct MockCounter {
        instance: Option<u8>,
        settings: Option<TimerSettings>,
        running: bool,
        remaining: u32,
        irq: TimerEvent,
        latched: TimerEvent,
    }

    impl TimerBackend for MockCounter {
        fn attach(&mut self, instance: u8) -> Result<(), TimerError> {
            self.instance = Some(instance);
            Ok(())
        }

        fn detach(&mut self) {
            self.instance = None;
        }

        fn program(&mut self, settings: &TimerSettings) -> Result<(), TimerError> {
            self.settings = Some(*settings);
            Ok(())
        }

        fn start(&mut self) {
            self.running = true;
        }

        fn stop(&mut self) {
            self.running = false;
        }

        fn restart(&mut self) {
            self.running = true;
            self.remaining = self.settings.map(|s| s.config.period).unwrap_or(0);
        }

        fn ticks_to_expiry(&self) -> u32 {
            self.remaining
        }

        fn set_interrupts(&mut self, events: TimerEvent, _priority: u8) {
            self.irq = events;
        }

        fn service_interrupt(&mut self) -> TimerEvent {
            core::mem::take(&mut self.latched)
        }
    }

    #[test]
    fn test_prescaler_windows() {
        assert_eq!(Divisor::for_frequency(1_000_000), Some(Divisor::Div1));
        assert_eq!(Divisor::for_frequency(1_020_000), Some(Divisor::Div1));
        assert_eq!(Divisor::for_frequency(1_020_001), None);
        assert_eq!(Divisor::for_frequency(62_500), Some(Divisor::Div16));
        assert_eq!(Divisor::for_frequency(61_250), Some(Divisor::Div16));
        assert_eq!(Divisor::for_frequency(3_906), Some(Divisor::Div256));
        assert_eq!(Divisor::for_frequency(3_828), Some(Divisor::Div256));
        assert_eq!(Divisor::for_frequency(3_827), None);
        assert_eq!(Divisor::for_frequency(500_000), None);
    }

    #[test]
    fn test_config_validation() {
        assert!(TimerConfig::default().validate().is_ok());
        let updown = TimerConfig {
            direction: CountDirection::UpDown,
            ..TimerConfig::default()
        };
        assert_eq!(updown.validate(), Err(TimerError::Unsupported));
        let compare = TimerConfig {
            compare_value: 100_001,
            ..TimerConfig::default()
        };
        assert_eq!(compare.validate(), Err(TimerError::InvalidCompare));
        let value = TimerConfig {
            value: 200_000,
            ..TimerConfig::default()
        };
        assert_eq!(value.validate(), Err(TimerError::InvalidValue));
    }

    #[test]
    fn test_counter_width() {
        let short = TimerConfig {
            period: 0xFFFE,
            ..TimerConfig::default()
        };
        assert_eq!(short.width(), CounterWidth::Bits16);
        let long = TimerConfig {
            period: 0xFFFF,
            ..TimerConfig::default()
        };
        assert_eq!(long.width(), CounterWidth::Bits32);
    }

    #[test]
    fn test_allocation() {
        let hw = HwManager::new_default();
        let first = Timer::init(&hw, MockCounter::default(), None).unwrap();
        let second = Timer::init(&hw, MockCounter::default(), None).unwrap();
        assert_eq!(first.instance(), 0);
        assert_eq!(second.instance(), 1);

        let err = Timer::init(&hw, MockCounter::default(), None).err().unwrap();
        assert_eq!(err.status(), StatusCode::InUse);
        let err = Timer::init(&hw, MockCounter::default(), Some(1)).err().unwrap();
        assert_eq!(err.status(), StatusCode::InUse);

        first.free().unwrap();
        let again = Timer::init(&hw, MockCounter::default(), Some(0)).unwrap();
        assert_eq!(again.with_backend(|b| b.instance), Some(0));
    }

    #[test]
    fn test_init_programs_defaults() {
        let hw = HwManager::new_default();
        let timer = Timer::init(&hw, MockCounter::default(), Some(1)).unwrap();
        let settings = timer.with_backend(|b| b.settings).unwrap();
        assert_eq!(settings.config, TimerConfig::default());
        assert_eq!(settings.divisor, Divisor::Div1);
        assert_eq!(settings.width, CounterWidth::Bits32);
        assert!(!timer.is_running().unwrap());
    }

    #[test]
    fn test_rejected_configure_keeps_previous() {
        let hw = HwManager::new_default();
        let timer = Timer::init(&hw, MockCounter::default(), None).unwrap();
        let config = TimerConfig {
            period: 5_000,
            is_continuous: false,
            ..TimerConfig::default()
        };
        timer.configure(config).unwrap();

        let bad = TimerConfig {
            direction: CountDirection::UpDown,
            ..config
        };
        assert!(timer.configure(bad).is_err());
        assert_eq!(timer.config().unwrap(), config);

        assert_eq!(
            timer.set_frequency(10_000),
            Err(Error::Timer(TimerError::InvalidFrequency))
        );
        assert_eq!(timer.divisor().unwrap(), Divisor::Div1);
    }

    #[test]
    fn test_read_scales_by_divisor() {
        let hw = HwManager::new_default();
        let timer = Timer::init(&hw, MockCounter::default(), None).unwrap();
        timer.set_frequency(62_500).unwrap();
        timer.with_backend(|b| b.remaining = 100);
        assert_eq!(timer.read().unwrap(), 1_600);
        assert_eq!(
            timer.with_backend(|b| b.settings.map(|s| s.divisor)),
            Some(Divisor::Div16)
        );
    }

    #[test]
    fn test_start_stop_reset() {
        let hw = HwManager::new_default();
        let timer = Timer::init(&hw, MockCounter::default(), None).unwrap();
        timer.start().unwrap();
        assert!(timer.with_backend(|b| b.running));
        timer.stop().unwrap();
        assert!(!timer.is_running().unwrap());
        timer.reset().unwrap();
        assert!(timer.is_running().unwrap());
        assert_eq!(timer.read().unwrap(), 100_000);
    }

    #[test]
    fn test_terminal_count_event() {
        static HITS: AtomicU32 = AtomicU32::new(0);
        fn on_event(note: Notification<TimerEvent>) {
            if note.events.contains(TimerEvent::TERMINAL_COUNT) {
                HITS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hw = HwManager::new_default();
        let timer = Timer::init(&hw, MockCounter::default(), None).unwrap();
        timer
            .configure(TimerConfig {
                is_continuous: false,
                ..TimerConfig::default()
            })
            .unwrap();
        timer.register_callback(Some(&on_event)).unwrap();
        timer.enable_event(TimerEvent::TERMINAL_COUNT, 3, true).unwrap();
        assert_eq!(timer.with_backend(|b| b.irq), TimerEvent::TERMINAL_COUNT);

        timer.start().unwrap();
        timer.with_backend(|b| b.latched = TimerEvent::TERMINAL_COUNT | TimerEvent::CAPTURE_COMPARE);
        timer.on_interrupt();
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        // One-shot timers stop at terminal count
        assert!(!timer.is_running().unwrap());
    }

    #[test]
    fn test_free_then_use() {
        let hw = HwManager::new_default();
        let timer = Timer::init(&hw, MockCounter::default(), None).unwrap();
        timer.free().unwrap();
        let not_init = Error::Timer(TimerError::NotInitialized);
        assert_eq!(timer.start(), Err(not_init));
        assert_eq!(timer.read(), Err(not_init));
        assert_eq!(timer.set_frequency(1_000_000), Err(not_init));
    }
}
