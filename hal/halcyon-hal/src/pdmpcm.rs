//! PDM to PCM converter
//!
//! Decimates a pulse-density microphone stream into 16-bit mono PCM. The
//! microphone is either digital (clock and data pins) or analog on the
//! dedicated mic pin. The analog path also occupies the ADC front end and
//! the first low-power comparator, which does the noise detection.
//!
//! The FIFO is a pair of ping-pong halves. Every interrupt hands over one
//! filled half of [`READ_LEN`] samples; an async read takes exactly one
//! half. The first halves after `start` hold settling data and are dropped,
//! and the converter only reports enabled once they have passed.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal::delay::DelayNs;
use heapless::Vec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::blocking::poll_until;
use crate::claim::{Claim, MAX_CLAIM};
use crate::event::{event_flags, EventCore, EventFlags, EventHandler};
use crate::hwmgr::{HwManager, Resource, ResourceType};
use crate::i2s::AsyncMode;
use crate::result::{peripheral_error, Result};
use crate::transfer::{Direction, Serviced, TransferEvent, TransferFault, Transfers};

/// Interrupt level of one FIFO half
pub const HALF_FIFO: usize = 127;

/// Samples moved by one read
pub const READ_LEN: usize = HALF_FIFO + 1;

/// Blocking read poll interval
pub const READ_POLL_US: u32 = 1_000;

/// A FIFO half fills well within this
pub const READ_TIMEOUT_MS: u32 = 20;

peripheral_error! {
    /// PDM/PCM status
    pub enum PdmPcmError {
        InvalidPin = 0x10 => InvalidArgument,
        /// PDM clock and decimation do not give a supported PCM rate
        InvalidDecimation = 0x11 => InvalidArgument,
        InvalidWordLength = 0x12 => InvalidArgument,
        /// Only one channel is converted
        StereoUnsupported = 0x13 => Unsupported,
        GainUnsupported = 0x14 => Unsupported,
        /// Reads move exactly one FIFO half
        InvalidReadLength = 0x15 => InvalidArgument,
        /// Analog front end has not settled
        FrontEndNotReady = 0x16 => Busy,
        /// Converter is stopped
        NotEnabled = 0x17 => Busy,
    }
}

/// Where the PDM stream comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PdmInput {
    /// Digital microphone
    Digital { clk: u8, data: u8 },
    /// Analog microphone through the ADC front end
    Analog { mic: u8 },
}

impl PdmInput {
    fn pins(&self) -> impl Iterator<Item = u8> {
        let (a, b) = match *self {
            PdmInput::Digital { clk, data } => (clk, Some(data)),
            PdmInput::Analog { mic } => (mic, None),
        };
        [Some(a), b].into_iter().flatten()
    }
}

/// Channel selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PdmMode {
    Left,
    Right,
    Stereo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PdmPcmConfig {
    /// PDM bit clock
    pub sample_rate_hz: u32,
    pub decimation_rate: u32,
    pub mode: PdmMode,
    pub word_length: u8,
    /// Gain in 0.5 dB steps
    pub left_gain: i16,
    pub right_gain: i16,
}

impl Default for PdmPcmConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 2_048_000,
            decimation_rate: 128,
            mode: PdmMode::Left,
            word_length: 16,
            left_gain: 0,
            right_gain: 0,
        }
    }
}

/// (PDM clock, decimation, PCM rate) the clock tree supports
const RATES: [(u32, u32, u32); 6] = [
    (2_048_000, 256, 8_000),
    (2_048_000, 128, 16_000),
    (1_024_000, 128, 8_000),
    (1_024_000, 64, 16_000),
    (512_000, 64, 8_000),
    (512_000, 32, 16_000),
];

impl PdmPcmConfig {
    /// Output rate, if the clock and decimation pair is supported
    pub fn pcm_rate_hz(&self) -> Option<u32> {
        RATES
            .iter()
            .find(|&&(clock, decimation, _)| {
                clock == self.sample_rate_hz && decimation == self.decimation_rate
            })
            .map(|&(_, _, rate)| rate)
    }

    pub fn validate(&self) -> Result<(), PdmPcmError> {
        if self.mode == PdmMode::Stereo {
            return Err(PdmPcmError::StereoUnsupported);
        }
        if self.word_length != 16 {
            return Err(PdmPcmError::InvalidWordLength);
        }
        if self.left_gain != 0 || self.right_gain != 0 {
            return Err(PdmPcmError::GainUnsupported);
        }
        if self.pcm_rate_hz().is_none() {
            return Err(PdmPcmError::InvalidDecimation);
        }
        Ok(())
    }

    /// FIFO halves to drop after start, covering the first 25 ms
    pub fn settling_halves(&self) -> u32 {
        let per_half = HALF_FIFO as u32 * self.decimation_rate * 1000;
        self.sample_rate_hz * 25 / per_half + 1
    }
}

event_flags! {
    /// PDM/PCM interrupt conditions
    pub struct PdmPcmEvent: u32 {
        /// A FIFO half is full
        const RX_HALF_FULL = 1 << 0;
        /// A full half was replaced before anyone read it
        const RX_OVERFLOW = 1 << 1;
        const ASYNC_COMPLETE = 1 << 2;
    }
}

impl EventFlags for PdmPcmEvent {
    fn completion(direction: Direction, outcome: &TransferEvent) -> Self {
        match (direction, outcome) {
            (Direction::Read, TransferEvent::Complete { .. }) => PdmPcmEvent::ASYNC_COMPLETE,
            (Direction::Read, TransferEvent::Error { kind: TransferFault::Overflow }) => {
                PdmPcmEvent::RX_OVERFLOW
            }
            _ => PdmPcmEvent::empty(),
        }
    }
}

/// Register glue for the converter
pub trait PdmPcmBackend {
    /// Route the microphone pins
    fn connect(&mut self, input: &PdmInput) -> Result<(), PdmPcmError>;

    fn disconnect(&mut self);

    fn apply(&mut self, config: &PdmPcmConfig) -> Result<(), PdmPcmError>;

    /// ADC front end ready and noise detector quiet; always true for a
    /// digital microphone
    fn front_end_ready(&mut self) -> bool;

    fn set_enabled(&mut self, enabled: bool);

    /// Flush both FIFO halves
    fn clear(&mut self);

    /// A FIFO half filled since the last call
    fn half_ready(&mut self) -> bool;

    /// Copy out the filled half; returns the sample count
    fn read_half(&mut self, buf: &mut [i16]) -> usize;

    fn set_interrupts(&mut self, events: PdmPcmEvent, priority: u8);
}

struct State<B> {
    backend: B,
    config: PdmPcmConfig,
    enabled: bool,
    settling: u32,
    /// The last filled half has not been read
    unread: bool,
    buffer: [i16; READ_LEN],
    filled: usize,
}

/// A claimed PDM/PCM converter
pub struct PdmPcm<'a, B: PdmPcmBackend> {
    claim: Claim<'a>,
    input: PdmInput,
    state: Mutex<CriticalSectionRawMutex, RefCell<State<B>>>,
    events: EventCore<PdmPcmEvent>,
    transfers: Transfers,
}

impl<'a, B: PdmPcmBackend> PdmPcm<'a, B> {
    /// Claim the converter and its microphone pins
    ///
    /// An analog microphone also claims the ADC block and comparator 0.
    /// The converter starts stopped.
    pub fn init(hw: &'a HwManager, mut backend: B, input: PdmInput, config: PdmPcmConfig) -> Result<Self> {
        config.validate()?;
        let pin_count = hw.layout().gpio.channels;
        if input.pins().any(|p| p >= pin_count) {
            return Err(PdmPcmError::InvalidPin.into());
        }
        let mut resources: Vec<Resource, MAX_CLAIM> = Vec::new();
        let _ = resources.push(Resource::block(ResourceType::PdmPcm, 0));
        for pin in input.pins() {
            let _ = resources.push(Resource::pin(pin));
        }
        if let PdmInput::Analog { .. } = input {
            let _ = resources.push(Resource::block(ResourceType::AdcMic, 0));
            let _ = resources.push(Resource::channel(ResourceType::Lpcomp, 0, 0));
        }
        let claim = Claim::acquire(hw, &resources)?;

        let routed = backend.connect(&input);
        if let Err(e) = routed.and_then(|_| backend.apply(&config)) {
            warn!("pdm: init rejected");
            backend.disconnect();
            return Err(e.into());
        }
        debug!(
            "pdm: claimed, {} Hz / {}",
            config.sample_rate_hz,
            config.decimation_rate
        );

        Ok(Self {
            claim,
            input,
            state: Mutex::new(RefCell::new(State {
                backend,
                config,
                enabled: false,
                settling: 0,
                unread: false,
                buffer: [0; READ_LEN],
                filled: 0,
            })),
            events: EventCore::new(),
            transfers: Transfers::new(),
        })
    }

    /// Configurator-based init is not available for this block
    pub fn init_cfg(_hw: &'a HwManager, _backend: B, _input: PdmInput, _config: PdmPcmConfig) -> Result<Self> {
        Err(PdmPcmError::Unsupported.into())
    }

    /// Stop the converter and release it
    pub fn free(&self) -> Result<()> {
        self.claim.check::<PdmPcmError>()?;
        self.abort_async()?;
        self.events.clear();
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_interrupts(PdmPcmEvent::empty(), 0);
            s.backend.set_enabled(false);
            s.backend.disconnect();
            s.enabled = false;
        });
        self.claim.release();
        debug!("pdm: freed");
        Ok(())
    }

    pub fn input(&self) -> PdmInput {
        self.input
    }

    pub fn config(&self) -> Result<PdmPcmConfig> {
        self.claim.check::<PdmPcmError>()?;
        Ok(self.state.lock(|s| s.borrow().config))
    }

    /// Start converting
    ///
    /// Fails with `Busy` while the analog front end is still settling.
    pub fn start(&self) -> Result<()> {
        self.claim.check::<PdmPcmError>()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.enabled {
                return Ok(());
            }
            if !s.backend.front_end_ready() {
                debug!("pdm: front end not ready");
                return Err(PdmPcmError::FrontEndNotReady.into());
            }
            s.backend.set_enabled(true);
            s.enabled = true;
            s.settling = s.config.settling_halves();
            s.unread = false;
            Ok(())
        })
    }

    /// Stop converting; a pending read stays queued
    pub fn stop(&self) -> Result<()> {
        self.claim.check::<PdmPcmError>()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_enabled(false);
            s.enabled = false;
        });
        Ok(())
    }

    /// Running and past the settling halves
    pub fn is_enabled(&self) -> Result<bool> {
        self.claim.check::<PdmPcmError>()?;
        Ok(self.state.lock(|s| {
            let s = s.borrow();
            s.enabled && s.settling == 0
        }))
    }

    /// Only unity gain is available
    pub fn set_gain(&self, left: i16, right: i16) -> Result<()> {
        self.claim.check::<PdmPcmError>()?;
        if left != 0 || right != 0 {
            return Err(PdmPcmError::GainUnsupported.into());
        }
        Ok(())
    }

    /// Drop whatever both FIFO halves hold
    pub fn clear(&self) -> Result<()> {
        self.claim.check::<PdmPcmError>()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.clear();
            s.unread = false;
        });
        Ok(())
    }

    /// Blocking read of one FIFO half
    ///
    /// Services the FIFO by polling. On timeout the read is aborted.
    pub fn read<D: DelayNs>(&self, buf: &mut [i16], delay: &mut D) -> Result<usize> {
        self.read_async(buf.len())?;
        let outcome = poll_until(delay, READ_TIMEOUT_MS, READ_POLL_US, PdmPcmError::Timeout, || {
            self.service();
            Ok(self.transfers.try_outcome(Direction::Read))
        });
        match outcome {
            Ok(TransferEvent::Complete { .. }) => self.take_read(buf),
            Ok(_) => Err(PdmPcmError::Aborted.into()),
            Err(e) => {
                warn!("pdm: read timed out");
                self.abort_async()?;
                Err(e.into())
            }
        }
    }

    /// Queue a read of the next filled FIFO half
    pub fn read_async(&self, len: usize) -> Result<()> {
        self.claim.check::<PdmPcmError>()?;
        if len != READ_LEN {
            return Err(PdmPcmError::InvalidReadLength.into());
        }
        if !self.state.lock(|s| s.borrow().enabled) {
            return Err(PdmPcmError::NotEnabled.into());
        }
        self.transfers.begin::<PdmPcmError>(Direction::Read, len)
            .map_err(Into::into)
    }

    /// Copy out the samples of the last completed read
    pub fn take_read(&self, buf: &mut [i16]) -> Result<usize> {
        self.claim.check::<PdmPcmError>()?;
        if self.transfers.is_pending(Direction::Read) {
            return Err(PdmPcmError::Busy.into());
        }
        Ok(self.state.lock(|s| {
            let s = s.borrow();
            let n = buf.len().min(s.filled);
            buf[..n].copy_from_slice(&s.buffer[..n]);
            n
        }))
    }

    pub fn is_pending(&self) -> Result<bool> {
        self.claim.check::<PdmPcmError>()?;
        Ok(self.transfers.is_pending(Direction::Read))
    }

    /// Cancel the pending read; no-op when idle
    pub fn abort_async(&self) -> Result<()> {
        self.claim.check::<PdmPcmError>()?;
        if self.transfers.abort(Direction::Read, &self.events) {
            debug!("pdm: async read aborted");
        }
        Ok(())
    }

    pub async fn wait_read(&self) -> Result<TransferEvent> {
        self.claim.check::<PdmPcmError>()?;
        self.transfers.wait::<PdmPcmError>(Direction::Read).await.map_err(Into::into)
    }

    /// Only CPU-serviced transfers are available
    pub fn set_async_mode(&self, mode: AsyncMode, _priority: u8) -> Result<()> {
        self.claim.check::<PdmPcmError>()?;
        match mode {
            AsyncMode::Sw => Ok(()),
            AsyncMode::Dma => Err(PdmPcmError::Unsupported.into()),
        }
    }

    pub fn register_callback(&self, handler: Option<&'static dyn EventHandler<PdmPcmEvent>>) -> Result<()> {
        self.claim.check::<PdmPcmError>()?;
        self.events.register(handler);
        Ok(())
    }

    pub fn enable_event(&self, event: PdmPcmEvent, priority: u8, enable: bool) -> Result<()> {
        self.claim.check::<PdmPcmError>()?;
        self.events.enable(event, priority, enable);
        let enabled = self.events.enabled();
        self.state.lock(|s| {
            s.borrow_mut()
                .backend
                .set_interrupts(enabled, self.events.priority())
        });
        Ok(())
    }

    pub fn enabled_events(&self) -> Result<PdmPcmEvent> {
        self.claim.check::<PdmPcmError>()?;
        Ok(self.events.enabled())
    }

    /// Interrupt entry point: one FIFO half filled
    pub fn on_interrupt(&self) {
        if !self.claim.is_live() {
            return;
        }
        self.service();
    }

    fn service(&self) {
        let (events, filled) = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let s = &mut *s;
            if !s.backend.half_ready() {
                return (PdmPcmEvent::empty(), None);
            }
            let mut events = PdmPcmEvent::empty();
            let overflow = s.unread;
            if overflow {
                events |= PdmPcmEvent::RX_OVERFLOW;
            }
            s.unread = true;

            if s.settling > 0 {
                s.settling -= 1;
                let mut scratch = [0i16; READ_LEN];
                s.backend.read_half(&mut scratch);
                s.unread = false;
                trace!("pdm: settling half dropped, {} left", s.settling);
                return (events, None);
            }

            let mut filled = None;
            if self.transfers.is_pending(Direction::Read) {
                s.filled = s.backend.read_half(&mut s.buffer);
                s.unread = false;
                filled = Some(s.filled);
            }
            if !overflow {
                events |= PdmPcmEvent::RX_HALF_FULL;
            }
            (events, filled)
        });
        let serviced = Serviced {
            events,
            read: filled.map(|n| TransferEvent::Complete { bytes: n * 2 }),
            write: None,
        };
        self.transfers.dispatch(serviced, &self.events);
    }

    /// Direct access to the register glue
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut().backend))
    }
}

impl<B: PdmPcmBackend> Drop for PdmPcm<'_, B> {
    fn drop(&mut self) {
        let _ = self.free();
    }
}
