//! ADC driver
//!
//! DC measurement on the analog front end. The converter runs at a fixed
//! 4.096 Msps with 15-bit results and only single-ended inputs against
//! VSSA, so most of the configuration surface is validated rather than
//! programmed. Up to [`CHANNELS`] pins can be attached at once; each is a
//! [`AdcChannel`] handle borrowed from the [`Adc`].
//!
//! Nothing can be measured until the front end has finished its DC offset
//! calibration, which runs from the interrupt after init.
//!
//! The same block also serves the analog microphone; that mode belongs to
//! [`crate::pdmpcm`] and is not reachable from here.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal::delay::DelayNs;
use heapless::Vec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::blocking::poll_until;
use crate::claim::Claim;
use crate::event::{event_flags, EventCore, EventFlags, EventHandler};
use crate::hwmgr::{HwManager, Resource, ResourceType};
use crate::i2s::AsyncMode;
use crate::result::{peripheral_error, Result};
use crate::transfer::{Direction, Serviced, TransferEvent, Transfers};

/// Channel slots on the block
pub const CHANNELS: usize = 8;

pub const RESOLUTION: u8 = 15;

/// Fixed conversion rate
pub const SAMPLE_RATE_HZ: u32 = 4_096_000;

/// One conversion period
pub const ACQUISITION_TIME_NS: u32 = 244;

/// Raw counts per volt once calibrated
pub const COUNTS_PER_VOLT: i32 = 0x8000;

/// Results one async scan can hold
pub const MAX_SCAN_RESULTS: usize = 64;

/// A conversion takes about 2 us; give up after a millisecond
const CONVERSION_TIMEOUT_MS: u32 = 1;

peripheral_error! {
    /// ADC status
    pub enum AdcError {
        InvalidPin = 0x10 => InvalidArgument,
        /// Only single-ended inputs are wired
        DifferentialUnsupported = 0x11 => InvalidArgument,
        /// Every channel slot is attached
        NoChannels = 0x12 => InUse,
        /// Settings the converter cannot provide
        InvalidConfig = 0x13 => InvalidArgument,
        InvalidSampleRate = 0x14 => InvalidArgument,
        /// DC offset calibration is still running
        NotCalibrated = 0x15 => Busy,
    }
}

/// Power setting shared by the analog blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PowerLevel {
    Off,
    Low,
    Medium,
    High,
    Default,
}

/// Reference voltage source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Vref {
    Internal,
    External,
    Vdda,
    VddaDiv2,
}

/// Negative input of single-ended channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Vneg {
    Vssa,
    Vref,
}

/// Block-wide settings
///
/// The default is the one combination the converter supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdcConfig {
    pub continuous_scanning: bool,
    pub resolution: u8,
    pub average_count: u16,
    pub average_mode_flags: u8,
    pub vref: Vref,
    pub vneg: Vneg,
    pub ext_vref_mv: u32,
    pub ext_vref: Option<u8>,
    pub is_bypassed: bool,
    pub bypass_pin: Option<u8>,
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            continuous_scanning: false,
            resolution: RESOLUTION,
            average_count: 1,
            average_mode_flags: 0,
            vref: Vref::Internal,
            vneg: Vneg::Vssa,
            ext_vref_mv: 0,
            ext_vref: None,
            is_bypassed: false,
            bypass_pin: None,
        }
    }
}

impl AdcConfig {
    pub fn validate(&self) -> Result<(), AdcError> {
        if *self == Self::default() {
            Ok(())
        } else {
            Err(AdcError::InvalidConfig)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelConfig {
    /// Disabled channels are skipped by async scans
    pub enabled: bool,
    pub enable_averaging: bool,
    pub min_acquisition_ns: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_averaging: false,
            min_acquisition_ns: ACQUISITION_TIME_NS,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), AdcError> {
        if self.enable_averaging || self.min_acquisition_ns > ACQUISITION_TIME_NS {
            return Err(AdcError::InvalidConfig);
        }
        Ok(())
    }
}

event_flags! {
    /// ADC interrupt conditions
    pub struct AdcEvent: u32 {
        /// A conversion finished
        const END_OF_SCAN = 1 << 0;
        const ASYNC_READ_COMPLETE = 1 << 1;
    }
}

impl EventFlags for AdcEvent {
    fn completion(direction: Direction, outcome: &TransferEvent) -> Self {
        match (direction, outcome) {
            (Direction::Read, TransferEvent::Complete { .. }) => AdcEvent::ASYNC_READ_COMPLETE,
            _ => AdcEvent::empty(),
        }
    }
}

/// Register glue for the ADC block
pub trait AdcBackend {
    fn connect(&mut self, block: u8) -> Result<(), AdcError>;

    fn disconnect(&mut self);

    /// Route `pin` to a DC input and return the input selector
    fn route(&mut self, pin: u8) -> Result<u8, AdcError>;

    fn unroute(&mut self, pin: u8);

    fn set_powered(&mut self, on: bool);

    /// DC offset calibration has finished
    fn is_calibrated(&self) -> bool;

    fn start_conversion(&mut self, input: u8);

    /// Result of the conversion in flight, once it is done
    fn conversion(&mut self) -> Option<i16>;

    fn stop(&mut self);

    /// Advance calibration and report a finished conversion
    fn service_interrupt(&mut self) -> Option<i16>;
}

/// Raw counts to microvolts
pub fn counts_to_uv(counts: i16) -> i32 {
    (i64::from(counts) * 1_000_000 / i64::from(COUNTS_PER_VOLT)) as i32
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    pin: u8,
    input: u8,
    enabled: bool,
}

#[derive(Debug, Clone, Copy)]
struct Scan {
    remaining: usize,
    cursor: usize,
    microvolts: bool,
}

struct State<B> {
    backend: B,
    config: AdcConfig,
    powered: bool,
    slots: [Option<Slot>; CHANNELS],
    scan: Option<Scan>,
    results: Vec<i32, MAX_SCAN_RESULTS>,
}

/// First enabled slot at or after `from`, wrapping around
fn next_enabled(slots: &[Option<Slot>; CHANNELS], from: usize) -> Option<usize> {
    (0..CHANNELS)
        .map(|i| (from + i) % CHANNELS)
        .find(|&i| slots[i].is_some_and(|slot| slot.enabled))
}

/// A claimed ADC block
pub struct Adc<'a, B: AdcBackend> {
    claim: Claim<'a>,
    block: u8,
    state: Mutex<CriticalSectionRawMutex, RefCell<State<B>>>,
    events: EventCore<AdcEvent>,
    transfers: Transfers,
}

impl<'a, B: AdcBackend> Adc<'a, B> {
    /// Claim ADC `block` for DC measurement
    pub fn init(hw: &'a HwManager, mut backend: B, block: u8) -> Result<Self> {
        let claim = Claim::acquire(hw, &[Resource::block(ResourceType::AdcMic, block)])?;
        backend.connect(block)?;
        backend.set_powered(true);
        debug!("adc{}: claimed", block);

        Ok(Self {
            claim,
            block,
            state: Mutex::new(RefCell::new(State {
                backend,
                config: AdcConfig::default(),
                powered: true,
                slots: [None; CHANNELS],
                scan: None,
                results: Vec::new(),
            })),
            events: EventCore::new(),
            transfers: Transfers::new(),
        })
    }

    /// Release the block and every attached pin
    ///
    /// Channel handles still alive fail with `NotInitialized` afterwards.
    pub fn free(&self) -> Result<()> {
        self.claim.check::<AdcError>()?;
        self.abort_async()?;
        self.events.clear();
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let s = &mut *s;
            for slot in s.slots.iter_mut() {
                if let Some(slot) = slot.take() {
                    s.backend.unroute(slot.pin);
                }
            }
            s.backend.set_powered(false);
            s.backend.disconnect();
            s.powered = false;
        });
        self.claim.release();
        debug!("adc{}: freed", self.block);
        Ok(())
    }

    pub fn block(&self) -> u8 {
        self.block
    }

    /// Check a block configuration; only the fixed hardware settings pass
    pub fn configure(&self, config: &AdcConfig) -> Result<()> {
        self.claim.check::<AdcError>()?;
        config.validate()?;
        self.state.lock(|s| s.borrow_mut().config = *config);
        Ok(())
    }

    pub fn config(&self) -> Result<AdcConfig> {
        self.claim.check::<AdcError>()?;
        Ok(self.state.lock(|s| s.borrow().config))
    }

    /// `Off` powers the converter down; every other level powers it up
    pub fn set_power(&self, level: PowerLevel) -> Result<()> {
        self.claim.check::<AdcError>()?;
        let on = level != PowerLevel::Off;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_powered(on);
            s.powered = on;
        });
        Ok(())
    }

    /// Validate a requested rate; returns the rate in effect
    pub fn set_sample_rate(&self, hz: u32) -> Result<u32> {
        self.claim.check::<AdcError>()?;
        if hz != SAMPLE_RATE_HZ {
            return Err(AdcError::InvalidSampleRate.into());
        }
        Ok(SAMPLE_RATE_HZ)
    }

    pub fn is_calibrated(&self) -> Result<bool> {
        self.claim.check::<AdcError>()?;
        Ok(self.state.lock(|s| s.borrow().backend.is_calibrated()))
    }

    /// Attach `vplus` as a single-ended channel
    ///
    /// `vminus` must be `None`: the negative side is always VSSA.
    pub fn channel(&self, vplus: u8, vminus: Option<u8>, config: ChannelConfig) -> Result<AdcChannel<'_, 'a, B>> {
        self.claim.check::<AdcError>()?;
        if vminus.is_some() {
            return Err(AdcError::DifferentialUnsupported.into());
        }
        config.validate()?;
        let index = self
            .state
            .lock(|s| s.borrow().slots.iter().position(Option::is_none))
            .ok_or(AdcError::NoChannels)?;

        self.claim.add(Resource::pin(vplus))?;
        let routed = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let input = s.backend.route(vplus)?;
            s.slots[index] = Some(Slot {
                pin: vplus,
                input,
                enabled: config.enabled,
            });
            Ok::<_, AdcError>(input)
        });
        match routed {
            Ok(input) => {
                debug!("adc{}: pin {} on input {}", self.block, vplus, input);
                Ok(AdcChannel { adc: self, index })
            }
            Err(e) => {
                let _ = self.claim.remove(Resource::pin(vplus));
                Err(e.into())
            }
        }
    }

    fn release_channel(&self, index: usize) -> Result<()> {
        self.claim.check::<AdcError>()?;
        let slot = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let slot = s.slots[index].take();
            if let Some(slot) = slot {
                s.backend.unroute(slot.pin);
            }
            slot
        });
        if let Some(slot) = slot {
            self.claim.remove(Resource::pin(slot.pin))?;
        }
        Ok(())
    }

    fn slot(&self, index: usize) -> Result<Slot> {
        self.claim.check::<AdcError>()?;
        self.state
            .lock(|s| s.borrow().slots[index])
            .ok_or_else(|| AdcError::NotInitialized.into())
    }

    fn convert<D: DelayNs>(&self, index: usize, delay: &mut D) -> Result<i16> {
        let slot = self.slot(index)?;
        if self.transfers.is_pending(Direction::Read) {
            return Err(AdcError::Busy.into());
        }
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if !s.backend.is_calibrated() {
                return Err(AdcError::NotCalibrated);
            }
            s.backend.start_conversion(slot.input);
            Ok(())
        })?;
        let raw = poll_until(delay, CONVERSION_TIMEOUT_MS, 1, AdcError::Timeout, || {
            Ok(self.state.lock(|s| s.borrow_mut().backend.conversion()))
        });
        self.state.lock(|s| s.borrow_mut().backend.stop());
        if raw.is_err() {
            warn!("adc{}: conversion timed out", self.block);
        }
        Ok(raw?)
    }

    /// Scan every enabled channel `scans` times, raw counts
    pub fn read_async(&self, scans: usize) -> Result<()> {
        self.start_scan(scans, false)
    }

    /// Scan every enabled channel `scans` times, in microvolts
    pub fn read_async_uv(&self, scans: usize) -> Result<()> {
        self.start_scan(scans, true)
    }

    fn start_scan(&self, scans: usize, microvolts: bool) -> Result<()> {
        self.claim.check::<AdcError>()?;
        if scans == 0 {
            return Err(AdcError::InvalidArgument.into());
        }
        let (calibrated, enabled) = self.state.lock(|s| {
            let s = s.borrow();
            let enabled = s
                .slots
                .iter()
                .filter(|slot| slot.is_some_and(|slot| slot.enabled))
                .count();
            (s.backend.is_calibrated(), enabled)
        });
        if !calibrated {
            return Err(AdcError::NotCalibrated.into());
        }
        if scans * enabled > MAX_SCAN_RESULTS {
            return Err(AdcError::InvalidArgument.into());
        }
        self.transfers
            .begin::<AdcError>(Direction::Read, scans * enabled)?;

        let started = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let s = &mut *s;
            s.results.clear();
            let cursor = next_enabled(&s.slots, 0)?;
            let input = s.slots[cursor]?.input;
            s.scan = Some(Scan {
                remaining: scans,
                cursor,
                microvolts,
            });
            s.backend.start_conversion(input);
            Some(())
        });
        if started.is_none() {
            debug!("adc{}: no enabled channel to scan", self.block);
            self.transfers
                .settle(Direction::Read, TransferEvent::Complete { bytes: 0 }, &self.events);
        }
        Ok(())
    }

    /// Copy out the results of the last scan, in scan order
    pub fn take_read(&self, buf: &mut [i32]) -> Result<usize> {
        self.claim.check::<AdcError>()?;
        if self.transfers.is_pending(Direction::Read) {
            return Err(AdcError::Busy.into());
        }
        Ok(self.state.lock(|s| {
            let s = s.borrow();
            let n = buf.len().min(s.results.len());
            buf[..n].copy_from_slice(&s.results[..n]);
            n
        }))
    }

    pub fn is_pending(&self) -> Result<bool> {
        self.claim.check::<AdcError>()?;
        Ok(self.transfers.is_pending(Direction::Read))
    }

    /// Stop the running scan; no-op when idle
    pub fn abort_async(&self) -> Result<()> {
        self.claim.check::<AdcError>()?;
        if self.transfers.is_pending(Direction::Read) {
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                s.scan = None;
                s.backend.stop();
            });
            if self.transfers.abort(Direction::Read, &self.events) {
                debug!("adc{}: scan aborted", self.block);
            }
        }
        Ok(())
    }

    pub async fn wait_read(&self) -> Result<TransferEvent> {
        self.claim.check::<AdcError>()?;
        self.transfers.wait::<AdcError>(Direction::Read).await.map_err(Into::into)
    }

    /// Each result needs the CPU anyway, so scans never use DMA
    pub fn set_async_mode(&self, mode: AsyncMode, _priority: u8) -> Result<()> {
        self.claim.check::<AdcError>()?;
        match mode {
            AsyncMode::Sw => Ok(()),
            AsyncMode::Dma => Err(AdcError::Unsupported.into()),
        }
    }

    /// No trigger inputs are wired to this block
    pub fn connect_trigger(&self, _source: u8) -> Result<()> {
        self.claim.check::<AdcError>()?;
        Err(AdcError::Unsupported.into())
    }

    /// No trigger outputs are wired to this block
    pub fn enable_trigger_output(&self) -> Result<u8> {
        self.claim.check::<AdcError>()?;
        Err(AdcError::Unsupported.into())
    }

    pub fn register_callback(&self, handler: Option<&'static dyn EventHandler<AdcEvent>>) -> Result<()> {
        self.claim.check::<AdcError>()?;
        self.events.register(handler);
        Ok(())
    }

    pub fn enable_event(&self, event: AdcEvent, priority: u8, enable: bool) -> Result<()> {
        self.claim.check::<AdcError>()?;
        self.events.enable(event, priority, enable);
        Ok(())
    }

    pub fn enabled_events(&self) -> Result<AdcEvent> {
        self.claim.check::<AdcError>()?;
        Ok(self.events.enabled())
    }

    /// Interrupt entry point for this block
    pub fn on_interrupt(&self) {
        if !self.claim.is_live() {
            return;
        }
        let (events, finished) = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let s = &mut *s;
            let Some(raw) = s.backend.service_interrupt() else {
                return (AdcEvent::empty(), None);
            };
            let Some(mut scan) = s.scan.take() else {
                return (AdcEvent::END_OF_SCAN, None);
            };
            let value = if scan.microvolts {
                counts_to_uv(raw)
            } else {
                i32::from(raw)
            };
            let _ = s.results.push(value);
            s.backend.stop();

            let Some(next) = next_enabled(&s.slots, (scan.cursor + 1) % CHANNELS) else {
                return (AdcEvent::END_OF_SCAN, Some(s.results.len()));
            };
            if next <= scan.cursor {
                scan.remaining -= 1;
            }
            if scan.remaining == 0 {
                return (AdcEvent::END_OF_SCAN, Some(s.results.len()));
            }
            scan.cursor = next;
            if let Some(slot) = s.slots[next] {
                s.backend.start_conversion(slot.input);
            }
            s.scan = Some(scan);
            (AdcEvent::END_OF_SCAN, None)
        });
        let serviced = Serviced {
            events,
            read: finished.map(|n| TransferEvent::Complete { bytes: n * 4 }),
            write: None,
        };
        self.transfers.dispatch(serviced, &self.events);
    }

    /// Direct access to the register glue
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut().backend))
    }
}

impl<B: AdcBackend> Drop for Adc<'_, B> {
    fn drop(&mut self) {
        let _ = self.free();
    }
}

/// One attached input pin
///
/// Dropping the handle detaches the pin.
pub struct AdcChannel<'h, 'a, B: AdcBackend> {
    adc: &'h Adc<'a, B>,
    index: usize,
}

impl<B: AdcBackend> AdcChannel<'_, '_, B> {
    /// Slot on the block
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pin(&self) -> Result<u8> {
        Ok(self.adc.slot(self.index)?.pin)
    }

    pub fn configure(&self, config: ChannelConfig) -> Result<()> {
        self.adc.slot(self.index)?;
        config.validate()?;
        self.adc.state.lock(|s| {
            if let Some(slot) = s.borrow_mut().slots[self.index].as_mut() {
                slot.enabled = config.enabled;
            }
        });
        Ok(())
    }

    /// Blocking conversion, raw counts
    pub fn read<D: DelayNs>(&self, delay: &mut D) -> Result<i32> {
        Ok(i32::from(self.adc.convert(self.index, delay)?))
    }

    /// Blocking conversion, raw counts as their 16-bit pattern
    pub fn read_u16<D: DelayNs>(&self, delay: &mut D) -> Result<u16> {
        Ok(self.adc.convert(self.index, delay)? as u16)
    }

    /// Blocking conversion in microvolts
    pub fn read_uv<D: DelayNs>(&self, delay: &mut D) -> Result<i32> {
        Ok(counts_to_uv(self.adc.convert(self.index, delay)?))
    }

    /// Detach the pin
    pub fn free(self) -> Result<()> {
        self.adc.release_channel(self.index)
    }
}

impl<B: AdcBackend> Drop for AdcChannel<'_, '_, B> {
    fn drop(&mut self) {
        let _ = self.adc.release_channel(self.index);
    }
}
