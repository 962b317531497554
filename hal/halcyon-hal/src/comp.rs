//! Comparator driver
//!
//! Two comparator channels sit on the analog front end. A channel compares
//! a positive and a negative input pin in DC mode; with the microphone's
//! positive pin as the only input it runs as a noise detector instead.
//! The result is a rising-edge latch, so only rising edges can raise an
//! event and a read is "did the output go high since the latch was cleared".

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal::delay::DelayNs;
use heapless::Vec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::adc::PowerLevel;
use crate::claim::{Claim, MAX_CLAIM};
use crate::event::{event_flags, EventCore, EventFlags, EventHandler};
use crate::hwmgr::{HwManager, Resource, ResourceType};
use crate::result::{peripheral_error, Result};
use crate::transfer::{Direction, TransferEvent};

/// Time for the latch to catch up after clearing it
pub const SETTLE_US: u32 = 100;

peripheral_error! {
    /// Comparator status
    pub enum CompError {
        /// Pin pair is not wired to a comparator channel
        InvalidPin = 0x10 => InvalidArgument,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CompMode {
    /// Positive pin against negative pin
    Dc,
    /// Microphone input against the internal threshold
    NoiseDetect,
}

/// Where a pin pair landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CompRoute {
    pub channel: u8,
    pub mode: CompMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CompConfig {
    pub power: PowerLevel,
    pub hysteresis: bool,
}

impl Default for CompConfig {
    fn default() -> Self {
        Self {
            power: PowerLevel::Default,
            hysteresis: false,
        }
    }
}

event_flags! {
    /// Comparator output edges
    pub struct CompEvent: u32 {
        const RISING_EDGE = 1 << 0;
        /// Not detectable by the latch; enabling it fails
        const FALLING_EDGE = 1 << 1;
    }
}

impl EventFlags for CompEvent {
    fn completion(_direction: Direction, _outcome: &TransferEvent) -> Self {
        CompEvent::empty()
    }
}

/// Register glue for the comparator block
pub trait CompBackend {
    /// Find the channel and mode serving this pin pair
    fn route(&mut self, vin_p: u8, vin_m: Option<u8>) -> Result<CompRoute, CompError>;

    fn connect(&mut self, route: CompRoute);

    fn disconnect(&mut self, channel: u8);

    fn apply(&mut self, channel: u8, config: &CompConfig);

    /// Output went high since the latch was last cleared
    fn latched_high(&self, channel: u8) -> bool;

    fn clear_latch(&mut self, channel: u8);

    fn set_interrupt(&mut self, channel: u8, enable: bool);

    /// Acknowledge the channel's interrupt; returns whether it was raised
    fn service_interrupt(&mut self, channel: u8) -> bool;
}

struct State<B> {
    backend: B,
    config: CompConfig,
}

/// A claimed comparator channel
pub struct Comp<'a, B: CompBackend> {
    claim: Claim<'a>,
    route: CompRoute,
    state: Mutex<CriticalSectionRawMutex, RefCell<State<B>>>,
    events: EventCore<CompEvent>,
}

impl<'a, B: CompBackend> Comp<'a, B> {
    /// Claim the channel serving `vin_p`/`vin_m`
    ///
    /// The output cannot be brought out to a pin; `output` must be `None`.
    pub fn init(
        hw: &'a HwManager,
        mut backend: B,
        vin_p: u8,
        vin_m: Option<u8>,
        output: Option<u8>,
        config: &CompConfig,
    ) -> Result<Self> {
        if output.is_some() {
            return Err(CompError::InvalidPin.into());
        }
        let route = backend.route(vin_p, vin_m)?;

        let mut resources: Vec<Resource, MAX_CLAIM> = Vec::new();
        let _ = resources.push(Resource::channel(ResourceType::Lpcomp, 0, route.channel));
        let _ = resources.push(Resource::pin(vin_p));
        if let Some(pin) = vin_m {
            let _ = resources.push(Resource::pin(pin));
        }
        let claim = Claim::acquire(hw, &resources)?;

        backend.connect(route);
        backend.apply(route.channel, config);
        backend.clear_latch(route.channel);
        debug!("comp{}: claimed in {:?} mode", route.channel, route.mode);

        Ok(Self {
            claim,
            route,
            state: Mutex::new(RefCell::new(State {
                backend,
                config: *config,
            })),
            events: EventCore::new(),
        })
    }

    pub fn free(&self) -> Result<()> {
        self.claim.check::<CompError>()?;
        self.events.clear();
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_interrupt(self.route.channel, false);
            s.backend.disconnect(self.route.channel);
        });
        self.claim.release();
        debug!("comp{}: freed", self.route.channel);
        Ok(())
    }

    pub fn channel(&self) -> u8 {
        self.route.channel
    }

    pub fn mode(&self) -> Result<CompMode> {
        self.claim.check::<CompError>()?;
        Ok(self.route.mode)
    }

    pub fn configure(&self, config: &CompConfig) -> Result<()> {
        self.claim.check::<CompError>()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.apply(self.route.channel, config);
            s.config = *config;
        });
        Ok(())
    }

    pub fn config(&self) -> Result<CompConfig> {
        self.claim.check::<CompError>()?;
        Ok(self.state.lock(|s| s.borrow().config))
    }

    /// Power follows the shared analog front end
    pub fn set_power(&self, _level: PowerLevel) -> Result<()> {
        self.claim.check::<CompError>()?;
        Err(CompError::Unsupported.into())
    }

    /// Sample the output
    ///
    /// Clears the latch, lets it settle, and reports whether the output
    /// went high in that window.
    pub fn read<D: DelayNs>(&self, delay: &mut D) -> Result<bool> {
        self.claim.check::<CompError>()?;
        let channel = self.route.channel;
        self.state.lock(|s| s.borrow_mut().backend.clear_latch(channel));
        delay.delay_us(SETTLE_US);
        Ok(self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let high = s.backend.latched_high(channel);
            s.backend.clear_latch(channel);
            high
        }))
    }

    pub fn register_callback(&self, handler: Option<&'static dyn EventHandler<CompEvent>>) -> Result<()> {
        self.claim.check::<CompError>()?;
        self.events.register(handler);
        Ok(())
    }

    pub fn enable_event(&self, event: CompEvent, priority: u8, enable: bool) -> Result<()> {
        self.claim.check::<CompError>()?;
        if event.contains(CompEvent::FALLING_EDGE) {
            return Err(CompError::Unsupported.into());
        }
        self.events.enable(event, priority, enable);
        let any = !self.events.enabled().is_empty();
        self.state
            .lock(|s| s.borrow_mut().backend.set_interrupt(self.route.channel, any));
        Ok(())
    }

    pub fn enabled_events(&self) -> Result<CompEvent> {
        self.claim.check::<CompError>()?;
        Ok(self.events.enabled())
    }

    /// Interrupt entry point for this channel
    pub fn on_interrupt(&self) {
        if !self.claim.is_live() {
            return;
        }
        let raised = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let raised = s.backend.service_interrupt(self.route.channel);
            if raised {
                s.backend.clear_latch(self.route.channel);
            }
            raised
        });
        if raised {
            trace!("comp{}: rising edge", self.route.channel);
            self.events.raise(CompEvent::RISING_EDGE);
        }
    }

    /// Direct access to the register glue
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut().backend))
    }
}

impl<B: CompBackend> Drop for Comp<'_, B> {
    fn drop(&mut self) {
        let _ = self.free();
    }
}
