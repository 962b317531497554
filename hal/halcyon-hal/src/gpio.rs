//! GPIO driver
//!
//! Claims a single pin, applies its drive configuration and dispatches
//! edge interrupts to the registered handler.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::claim::Claim;
use crate::event::{event_flags, EventCore, EventFlags, EventHandler};
use crate::hwmgr::{HwManager, Resource};
use crate::result::{peripheral_error, Result};
use crate::transfer::{Direction, TransferEvent};

peripheral_error! {
    /// GPIO status
    pub enum GpioError {
        /// Pin number outside the chip's GPIO range
        InvalidPin = 0x10 => InvalidArgument,
    }
}

/// Pin direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GpioDirection {
    Input,
    Output,
    /// Input and output at once (not available on this part)
    Bidirectional,
}

/// Electrical drive mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DriveMode {
    /// Digital high-impedance
    None,
    Analog,
    PullUp,
    PullDown,
    OpenDrainDriveLow,
    OpenDrainDriveHigh,
    Strong,
    PullUpDown,
}

impl DriveMode {
    /// No pull resistor
    pub const PULL_NONE: DriveMode = DriveMode::None;
}

/// Complete pin configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GpioConfig {
    pub direction: GpioDirection,
    pub drive_mode: DriveMode,
    /// Output level driven right after init
    pub init_value: bool,
}

impl GpioConfig {
    pub const fn new(direction: GpioDirection, drive_mode: DriveMode, init_value: bool) -> Self {
        Self {
            direction,
            drive_mode,
            init_value,
        }
    }

    fn validate(&self) -> Result<(), GpioError> {
        match self.direction {
            GpioDirection::Bidirectional => Err(GpioError::Unsupported),
            _ => Ok(()),
        }
    }
}

event_flags! {
    /// GPIO interrupt edges
    pub struct GpioEvent: u32 {
        const RISE = 1 << 0;
        const FALL = 1 << 1;
        const BOTH = Self::RISE.bits() | Self::FALL.bits();
    }
}

impl EventFlags for GpioEvent {
    fn completion(_direction: Direction, _outcome: &TransferEvent) -> Self {
        // Pins never run transfers
        GpioEvent::empty()
    }
}

/// Edge trigger programmed into the pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    fn from_events(events: GpioEvent) -> Option<Self> {
        if events.contains(GpioEvent::BOTH) {
            Some(Edge::Both)
        } else if events.contains(GpioEvent::RISE) {
            Some(Edge::Rising)
        } else if events.contains(GpioEvent::FALL) {
            Some(Edge::Falling)
        } else {
            None
        }
    }
}

/// Register glue for a GPIO port
pub trait GpioBackend {
    /// Route `pin` as GPIO and apply `config`
    ///
    /// Must not leave the pin partially configured on error.
    fn apply(&mut self, pin: u8, config: &GpioConfig) -> Result<(), GpioError>;

    /// Return the pin to its reset state
    fn disconnect(&mut self, pin: u8);

    fn write(&mut self, pin: u8, high: bool);

    /// Level seen on the pad
    fn read(&self, pin: u8) -> bool;

    /// Level latched in the output register
    fn output_level(&self, pin: u8) -> bool;

    /// Program the edge trigger; `None` disables the pin interrupt
    fn set_trigger(&mut self, pin: u8, edge: Option<Edge>, priority: u8);

    /// Read and clear latched edges
    fn take_edges(&mut self, pin: u8) -> GpioEvent;
}

struct State<B> {
    backend: B,
    config: GpioConfig,
}

/// A claimed GPIO pin
pub struct Gpio<'a, B: GpioBackend> {
    claim: Claim<'a>,
    pin: u8,
    state: Mutex<CriticalSectionRawMutex, RefCell<State<B>>>,
    events: EventCore<GpioEvent>,
}

impl<'a, B: GpioBackend> Gpio<'a, B> {
    /// Claim `pin` and configure it
    ///
    /// Fails if the pin is out of range, already claimed, or the
    /// configuration is not supported. A failure after the pin was
    /// reserved releases it again.
    pub fn init(
        hw: &'a HwManager,
        mut backend: B,
        pin: u8,
        direction: GpioDirection,
        drive_mode: DriveMode,
        init_value: bool,
    ) -> Result<Self> {
        let config = GpioConfig::new(direction, drive_mode, init_value);
        config.validate()?;
        if pin >= hw.layout().gpio.channels {
            return Err(GpioError::InvalidPin.into());
        }

        let claim = Claim::acquire(hw, &[Resource::pin(pin)])?;
        if let Err(e) = backend.apply(pin, &config) {
            warn!("gpio: pin {} rejected configuration", pin);
            // Dropping the claim releases the pin
            drop(claim);
            return Err(e.into());
        }
        backend.write(pin, init_value);
        debug!("gpio: pin {} claimed", pin);

        Ok(Self {
            claim,
            pin,
            state: Mutex::new(RefCell::new(State { backend, config })),
            events: EventCore::new(),
        })
    }

    /// Release the pin
    ///
    /// Unregisters the callback, disables the interrupt and disconnects
    /// the pad. Every later call fails with `NotInitialized`.
    pub fn free(&self) -> Result<()> {
        self.claim.check::<GpioError>()?;
        self.events.clear();
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_trigger(self.pin, None, 0);
            s.backend.disconnect(self.pin);
        });
        self.claim.release();
        debug!("gpio: pin {} freed", self.pin);
        Ok(())
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn config(&self) -> Result<GpioConfig> {
        self.claim.check::<GpioError>()?;
        Ok(self.state.lock(|s| s.borrow().config))
    }

    /// Change direction and drive mode
    ///
    /// The output level and interrupt configuration are kept.
    pub fn configure(&self, direction: GpioDirection, drive_mode: DriveMode) -> Result<()> {
        self.claim.check::<GpioError>()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let level = s.backend.output_level(self.pin);
            let config = GpioConfig::new(direction, drive_mode, level);
            config.validate()?;
            s.backend.apply(self.pin, &config)?;
            s.config = config;
            Ok(())
        })
    }

    pub fn write(&self, high: bool) -> Result<()> {
        self.claim.check::<GpioError>()?;
        self.state
            .lock(|s| s.borrow_mut().backend.write(self.pin, high));
        Ok(())
    }

    pub fn read(&self) -> Result<bool> {
        self.claim.check::<GpioError>()?;
        Ok(self.state.lock(|s| s.borrow().backend.read(self.pin)))
    }

    /// Level currently driven by the output register
    pub fn output_level(&self) -> Result<bool> {
        self.claim.check::<GpioError>()?;
        Ok(self.state.lock(|s| s.borrow().backend.output_level(self.pin)))
    }

    pub fn toggle(&self) -> Result<()> {
        self.claim.check::<GpioError>()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let level = s.backend.output_level(self.pin);
            s.backend.write(self.pin, !level);
        });
        Ok(())
    }

    /// Replace the edge handler; `None` unregisters
    pub fn register_callback(
        &self,
        handler: Option<&'static dyn EventHandler<GpioEvent>>,
    ) -> Result<()> {
        self.claim.check::<GpioError>()?;
        critical_section::with(|_| self.events.register(handler));
        Ok(())
    }

    /// Enable or disable edge events
    ///
    /// The pin trigger follows the resulting mask; disabling every edge
    /// turns the pin interrupt off.
    pub fn enable_event(&self, event: GpioEvent, priority: u8, enable: bool) -> Result<()> {
        self.claim.check::<GpioError>()?;
        self.events.enable(event, priority, enable);
        let edge = Edge::from_events(self.events.enabled());
        self.state.lock(|s| {
            s.borrow_mut()
                .backend
                .set_trigger(self.pin, edge, self.events.priority())
        });
        Ok(())
    }

    pub fn enabled_events(&self) -> Result<GpioEvent> {
        self.claim.check::<GpioError>()?;
        Ok(self.events.enabled())
    }

    /// Interrupt entry point for this pin
    pub fn on_interrupt(&self) {
        if !self.claim.is_live() {
            return;
        }
        let edges = self.state.lock(|s| s.borrow_mut().backend.take_edges(self.pin));
        trace!("gpio: pin {} edges {=u32:#x}", self.pin, edges.bits());
        self.events.raise(edges);
    }

    /// Direct access to the register glue
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut().backend))
    }
}

impl<B: GpioBackend> Drop for Gpio<'_, B> {
    fn drop(&mut self) {
        let _ = self.free();
    }
}

impl<B: GpioBackend> embedded_hal::digital::ErrorType for Gpio<'_, B> {
    type Error = crate::result::Error;
}

impl<B: GpioBackend> embedded_hal::digital::OutputPin for Gpio<'_, B> {
    fn set_low(&mut self) -> Result<()> {
        self.write(false)
    }

    fn set_high(&mut self) -> Result<()> {
        self.write(true)
    }
}

impl<B: GpioBackend> embedded_hal::digital::StatefulOutputPin for Gpio<'_, B> {
    fn is_set_high(&mut self) -> Result<bool> {
        self.output_level()
    }

    fn is_set_low(&mut self) -> Result<bool> {
        self.output_level().map(|high| !high)
    }

    fn toggle(&mut self) -> Result<()> {
        Gpio::toggle(self)
    }
}

impl<B: GpioBackend> embedded_hal::digital::InputPin for Gpio<'_, B> {
    fn is_high(&mut self) -> Result<bool> {
        self.read()
    }

    fn is_low(&mut self) -> Result<bool> {
        self.read().map(|high| !high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwmgr::HwmgrError;
    use crate::result::{Error, StatusCode};
    use embedded_hal::digital::{OutputPin, StatefulOutputPin};
    use portable_atomic::{AtomicU32, Ordering};

    /// Single-pin mock port
    struct MockPort {
        applied: Option<GpioConfig>,
        output: bool,
        pad: bool,
        trigger: Option<Edge>,
        latched: GpioEvent,
        reject: bool,
        connected: bool,
    }

    impl MockPort {
        fn new() -> Self {
            Self {
                applied: None,
                output: false,
                pad: false,
                trigger: None,
                latched: GpioEvent::empty(),
                reject: false,
                connected: false,
            }
        }
    }

    impl GpioBackend for MockPort {
        fn apply(&mut self, _pin: u8, config: &GpioConfig) -> Result<(), GpioError> {
            if self.reject {
                return Err(GpioError::InvalidArgument);
            }
            self.applied = Some(*config);
            self.connected = true;
            Ok(())
        }

        fn disconnect(&mut self, _pin: u8) {
            self.connected = false;
        }

        fn write(&mut self, _pin: u8, high: bool) {
            self.output = high;
        }

        fn read(&self, _pin: u8) -> bool {
            self.pad
        }

        fn output_level(&self, _pin: u8) -> bool {
            self.output
        }

        fn set_trigger(&mut self, _pin: u8, edge: Option<Edge>, _priority: u8) {
            self.trigger = edge;
        }

        fn take_edges(&mut self, _pin: u8) -> GpioEvent {
            core::mem::replace(&mut self.latched, GpioEvent::empty())
        }
    }

    fn output_pin(hw: &HwManager, pin: u8) -> Gpio<'_, MockPort> {
        Gpio::init(
            hw,
            MockPort::new(),
            pin,
            GpioDirection::Output,
            DriveMode::Strong,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_init_applies_initial_level() {
        let hw = HwManager::new_default();
        let pin = output_pin(&hw, 4);
        assert!(pin.output_level().unwrap());
        assert!(pin.with_backend(|b| b.connected));
    }

    #[test]
    fn test_second_init_is_in_use() {
        let hw = HwManager::new_default();
        let _pin = output_pin(&hw, 4);
        let err = Gpio::init(
            &hw,
            MockPort::new(),
            4,
            GpioDirection::Input,
            DriveMode::None,
            false,
        )
        .err()
        .unwrap();
        assert_eq!(err, Error::Hwmgr(HwmgrError::InUse));
    }

    #[test]
    fn test_invalid_pin() {
        let hw = HwManager::new_default();
        let err = Gpio::init(&hw, MockPort::new(), 60, GpioDirection::Input, DriveMode::None, false)
            .err()
            .unwrap();
        assert_eq!(err, Error::Gpio(GpioError::InvalidPin));
    }

    #[test]
    fn test_bidirectional_unsupported() {
        let hw = HwManager::new_default();
        let err = Gpio::init(
            &hw,
            MockPort::new(),
            2,
            GpioDirection::Bidirectional,
            DriveMode::Strong,
            false,
        )
        .err()
        .unwrap();
        assert_eq!(err.status(), StatusCode::Unsupported);
        assert_eq!(hw.reserved_count(), 0);
    }

    #[test]
    fn test_backend_rejection_rolls_back() {
        let hw = HwManager::new_default();
        let mut port = MockPort::new();
        port.reject = true;
        let result = Gpio::init(&hw, port, 5, GpioDirection::Output, DriveMode::Strong, false);
        assert!(result.is_err());
        assert!(!hw.is_reserved(Resource::pin(5)).unwrap());
    }

    #[test]
    fn test_free_then_use_is_not_initialized() {
        let hw = HwManager::new_default();
        let pin = output_pin(&hw, 6);
        pin.free().unwrap();

        let not_init = Error::Gpio(GpioError::NotInitialized);
        assert_eq!(pin.write(true), Err(not_init));
        assert_eq!(pin.read(), Err(not_init));
        assert_eq!(pin.toggle(), Err(not_init));
        assert_eq!(pin.free(), Err(not_init));
        assert_eq!(pin.enable_event(GpioEvent::RISE, 0, true), Err(not_init));
        assert_eq!(pin.enabled_events(), Err(not_init));
        assert!(!pin.with_backend(|b| b.connected));

        // The pin can be claimed again
        let _again = output_pin(&hw, 6);
    }

    #[test]
    fn test_toggle() {
        let hw = HwManager::new_default();
        let mut pin = output_pin(&hw, 7);
        pin.toggle().unwrap();
        assert!(!pin.output_level().unwrap());
        pin.set_high().unwrap();
        assert!(pin.is_set_high().unwrap());
        StatefulOutputPin::toggle(&mut pin).unwrap();
        assert!(pin.is_set_low().unwrap());
    }

    #[test]
    fn test_configure_rejection_keeps_previous() {
        let hw = HwManager::new_default();
        let pin = output_pin(&hw, 8);
        let before = pin.config().unwrap();

        let err = pin
            .configure(GpioDirection::Bidirectional, DriveMode::PullUp)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::Unsupported);
        assert_eq!(pin.config().unwrap(), before);

        pin.with_backend(|b| b.reject = true);
        assert!(pin.configure(GpioDirection::Input, DriveMode::PullUp).is_err());
        assert_eq!(pin.config().unwrap(), before);
    }

    #[test]
    fn test_enable_event_programs_trigger() {
        let hw = HwManager::new_default();
        let pin = output_pin(&hw, 9);

        pin.enable_event(GpioEvent::RISE, 2, true).unwrap();
        assert_eq!(pin.with_backend(|b| b.trigger), Some(Edge::Rising));
        pin.enable_event(GpioEvent::FALL, 2, true).unwrap();
        assert_eq!(pin.with_backend(|b| b.trigger), Some(Edge::Both));
        assert_eq!(pin.enabled_events(), Ok(GpioEvent::BOTH));
        pin.enable_event(GpioEvent::BOTH, 2, false).unwrap();
        assert_eq!(pin.with_backend(|b| b.trigger), None);
    }

    #[test]
    fn test_interrupt_delivers_enabled_edges() {
        static EDGES: AtomicU32 = AtomicU32::new(0);
        fn on_edge(note: crate::event::Notification<GpioEvent>) {
            EDGES.fetch_or(note.events.bits(), Ordering::SeqCst);
        }

        let hw = HwManager::new_default();
        let pin = output_pin(&hw, 10);
        pin.register_callback(Some(&on_edge)).unwrap();
        pin.enable_event(GpioEvent::FALL, 0, true).unwrap();

        pin.with_backend(|b| b.latched = GpioEvent::BOTH);
        pin.on_interrupt();
        assert_eq!(EDGES.load(Ordering::SeqCst), GpioEvent::FALL.bits());
    }

    #[test]
    fn test_drop_releases_pin() {
        let hw = HwManager::new_default();
        {
            let _pin = output_pin(&hw, 11);
        }
        assert!(!hw.is_reserved(Resource::pin(11)).unwrap());
    }
}
