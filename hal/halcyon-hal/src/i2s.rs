//! I2S driver
//!
//! One audio serial block with independent transmit and receive halves.
//! Each half is optional at init, owns its own TDM channel and pins, and
//! is started and stopped on its own. Samples are 32-bit words whatever
//! the configured word length.
//!
//! Async transfers may be queued on a stopped half; data only moves once
//! the half is started.

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
use crate::result::{peripheral_error, Result};
use crate::transfer::{Direction, Serviced, TransferEvent, TransferFault, Transfers};

/// FIFO poll interval for blocking calls
pub const POLL_INTERVAL_US: u32 = 10;

peripheral_error! {
    /// I2S status
    pub enum I2sError {
        InvalidPin = 0x10 => InvalidArgument,
        /// Neither direction has pins
        NoDirection = 0x11 => InvalidArgument,
        InvalidChannelLength = 0x12 => InvalidArgument,
        InvalidWordLength = 0x13 => InvalidArgument,
        InvalidSampleRate = 0x14 => InvalidArgument,
        /// MCLK is not a whole multiple of the bit clock
        InvalidMclk = 0x15 => InvalidArgument,
        /// The direction was not given pins at init
        DirectionNotConfigured = 0x16 => Unsupported,
    }
}

/// Pins of one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct I2sPins {
    /// Bit clock
    pub sck: u8,
    /// Word select
    pub ws: u8,
    pub data: u8,
    /// External master clock input
    pub mclk: Option<u8>,
}

impl I2sPins {
    fn iter(&self) -> impl Iterator<Item = u8> {
        [Some(self.sck), Some(self.ws), Some(self.data), self.mclk]
            .into_iter()
            .flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct I2sConfig {
    pub is_tx_slave: bool,
    pub is_rx_slave: bool,
    /// External MCLK frequency, 0 to use the internal clock
    pub mclk_hz: u32,
    /// Bits per channel slot
    pub channel_length: u8,
    /// Significant bits per sample
    pub word_length: u8,
    pub sample_rate_hz: u32,
}

impl Default for I2sConfig {
    fn default() -> Self {
        Self {
            is_tx_slave: false,
            is_rx_slave: false,
            mclk_hz: 0,
            channel_length: 32,
            word_length: 16,
            sample_rate_hz: 48_000,
        }
    }
}

impl I2sConfig {
    pub const MIN_SAMPLE_RATE: u32 = 8_000;
    pub const MAX_SAMPLE_RATE: u32 = 192_000;

    /// Bit clock for a stereo frame
    pub fn bit_clock_hz(&self) -> u32 {
        self.sample_rate_hz * u32::from(self.channel_length) * 2
    }

    pub fn validate(&self) -> Result<(), I2sError> {
        if !(8..=32).contains(&self.channel_length) {
            return Err(I2sError::InvalidChannelLength);
        }
        if self.word_length < 8 || self.word_length > self.channel_length {
            return Err(I2sError::InvalidWordLength);
        }
        if !(Self::MIN_SAMPLE_RATE..=Self::MAX_SAMPLE_RATE).contains(&self.sample_rate_hz) {
            return Err(I2sError::InvalidSampleRate);
        }
        if self.mclk_hz != 0 && self.mclk_hz % self.bit_clock_hz() != 0 {
            return Err(I2sError::InvalidMclk);
        }
        Ok(())
    }
}

/// How async transfers are fed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AsyncMode {
    /// FIFO interrupts, serviced by the CPU
    Sw,
    /// DMA channel
    Dma,
}

event_flags! {
    /// I2S interrupt conditions
    pub struct I2sEvent: u32 {
        const TX_NOT_FULL = 1 << 0;
        const TX_HALF_EMPTY = 1 << 1;
        const TX_EMPTY = 1 << 2;
        const TX_OVERFLOW = 1 << 3;
        const TX_UNDERFLOW = 1 << 4;
        const ASYNC_TX_COMPLETE = 1 << 5;
        const RX_NOT_EMPTY = 1 << 6;
        const RX_HALF_FULL = 1 << 7;
        const RX_FULL = 1 << 8;
        const RX_OVERFLOW = 1 << 9;
        const RX_UNDERFLOW = 1 << 10;
        const ASYNC_RX_COMPLETE = 1 << 11;
    }
}

impl EventFlags for I2sEvent {
    fn completion(direction: Direction, outcome: &TransferEvent) -> Self {
        match (direction, outcome) {
            (Direction::Write, TransferEvent::Complete { .. }) => I2sEvent::ASYNC_TX_COMPLETE,
            (Direction::Read, TransferEvent::Complete { .. }) => I2sEvent::ASYNC_RX_COMPLETE,
            (Direction::Write, TransferEvent::Error { kind: TransferFault::Overflow }) => {
                I2sEvent::TX_OVERFLOW
            }
            (Direction::Write, TransferEvent::Error { kind: TransferFault::Underflow }) => {
                I2sEvent::TX_UNDERFLOW
            }
            (Direction::Read, TransferEvent::Error { kind: TransferFault::Overflow }) => {
                I2sEvent::RX_OVERFLOW
            }
            (Direction::Read, TransferEvent::Error { kind: TransferFault::Underflow }) => {
                I2sEvent::RX_UNDERFLOW
            }
            _ => I2sEvent::empty(),
        }
    }
}

/// Register glue for one audio serial block
pub trait I2sBackend {
    /// Route the pins of the directions in use
    fn connect(
        &mut self,
        block: u8,
        tx: Option<&I2sPins>,
        rx: Option<&I2sPins>,
    ) -> Result<(), I2sError>;

    fn disconnect(&mut self);

    /// Program clocks and frame format; must not partially apply
    fn apply(&mut self, config: &I2sConfig) -> Result<(), I2sError>;

    /// Start or stop one half
    fn set_enabled(&mut self, direction: Direction, enabled: bool);

    /// Flush one half's FIFO
    fn clear(&mut self, direction: Direction);

    fn tx_free(&self) -> usize;

    fn rx_available(&self) -> usize;

    fn push(&mut self, sample: u32);

    fn pop(&mut self) -> Option<u32>;

    /// Samples are still shifting out
    fn tx_busy(&self) -> bool;

    fn set_async_mode(&mut self, mode: AsyncMode, priority: u8) -> Result<(), I2sError>;

    /// Queue samples for an async write
    fn start_write(&mut self, samples: &[u32]) -> Result<(), I2sError>;

    /// Queue an async read of `len` samples
    fn start_read(&mut self, len: usize) -> Result<(), I2sError>;

    fn cancel(&mut self, direction: Direction);

    /// Copy out what the last async read collected
    fn take_read(&mut self, buf: &mut [u32]) -> usize;

    fn set_interrupts(&mut self, events: I2sEvent, priority: u8);

    fn service_interrupt(&mut self) -> Serviced<I2sEvent>;
}

struct State<B> {
    backend: B,
    config: I2sConfig,
    tx_enabled: bool,
    rx_enabled: bool,
    async_mode: AsyncMode,
}

/// A claimed I2S block
pub struct I2s<'a, B: I2sBackend> {
    claim: Claim<'a>,
    block: u8,
    tx_pins: Option<I2sPins>,
    rx_pins: Option<I2sPins>,
    state: Mutex<CriticalSectionRawMutex, RefCell<State<B>>>,
    events: EventCore<I2sEvent>,
    transfers: Transfers,
}

impl<'a, B: I2sBackend> I2s<'a, B> {
    /// Claim `block` for the given directions
    ///
    /// Both halves start stopped.
    pub fn init(
        hw: &'a HwManager,
        mut backend: B,
        block: u8,
        tx_pins: Option<I2sPins>,
        rx_pins: Option<I2sPins>,
        config: I2sConfig,
    ) -> Result<Self> {
        if tx_pins.is_none() && rx_pins.is_none() {
            return Err(I2sError::NoDirection.into());
        }
        config.validate()?;
        let pin_count = hw.layout().gpio.channels;
        let mut resources: Vec<Resource, MAX_CLAIM> = Vec::new();
        for (channel, pins) in [(0, &tx_pins), (1, &rx_pins)] {
            let Some(pins) = pins else { continue };
            if pins.iter().any(|p| p >= pin_count) {
                return Err(I2sError::InvalidPin.into());
            }
            let _ = resources.push(Resource::channel(ResourceType::Tdm, block, channel));
            for pin in pins.iter() {
                let _ = resources.push(Resource::pin(pin));
            }
        }
        let claim = Claim::acquire(hw, &resources)?;

        let routed = backend.connect(block, tx_pins.as_ref(), rx_pins.as_ref());
        if let Err(e) = routed.and_then(|_| backend.apply(&config)) {
            warn!("i2s{}: init rejected", block);
            backend.disconnect();
            return Err(e.into());
        }
        debug!(
            "i2s{}: claimed, {} Hz, {}/{} bits",
            block,
            config.sample_rate_hz,
            config.word_length,
            config.channel_length
        );

        Ok(Self {
            claim,
            block,
            tx_pins,
            rx_pins,
            state: Mutex::new(RefCell::new(State {
                backend,
                config,
                tx_enabled: false,
                rx_enabled: false,
                async_mode: AsyncMode::Sw,
            })),
            events: EventCore::new(),
            transfers: Transfers::new(),
        })
    }

    /// Stop both halves and release the block
    ///
    /// Pending async transfers are aborted and reported as such.
    pub fn free(&self) -> Result<()> {
        self.claim.check::<I2sError>()?;
        self.abort_write_async()?;
        self.abort_read_async()?;
        self.events.clear();
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_interrupts(I2sEvent::empty(), 0);
            s.backend.set_enabled(Direction::Write, false);
            s.backend.set_enabled(Direction::Read, false);
            s.backend.disconnect();
            s.tx_enabled = false;
            s.rx_enabled = false;
        });
        self.claim.release();
        debug!("i2s{}: freed", self.block);
        Ok(())
    }

    pub fn config(&self) -> Result<I2sConfig> {
        self.claim.check::<I2sError>()?;
        Ok(self.state.lock(|s| s.borrow().config))
    }

    fn require(&self, direction: Direction) -> Result<()> {
        self.claim.check::<I2sError>()?;
        let pins = match direction {
            Direction::Write => &self.tx_pins,
            Direction::Read => &self.rx_pins,
        };
        if pins.is_none() {
            return Err(I2sError::DirectionNotConfigured.into());
        }
        Ok(())
    }

    /// Change the sample rate; the previous rate stays on error
    ///
    /// Refused with `Busy` while an async transfer is pending.
    pub fn set_sample_rate(&self, hz: u32) -> Result<()> {
        self.claim.check::<I2sError>()?;
        if self.transfers.is_busy() {
            debug!("i2s{}: sample rate change while async transfer pending", self.block);
            return Err(I2sError::Busy.into());
        }
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let config = I2sConfig {
                sample_rate_hz: hz,
                ..s.config
            };
            config.validate()?;
            s.backend.apply(&config)?;
            s.config = config;
            Ok(())
        })
    }

    fn set_enabled(&self, direction: Direction, enabled: bool) -> Result<()> {
        self.require(direction)?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_enabled(direction, enabled);
            match direction {
                Direction::Write => s.tx_enabled = enabled,
                Direction::Read => s.rx_enabled = enabled,
            }
        });
        Ok(())
    }

    pub fn start_tx(&self) -> Result<()> {
        self.set_enabled(Direction::Write, true)
    }

    pub fn stop_tx(&self) -> Result<()> {
        self.set_enabled(Direction::Write, false)
    }

    /// Flush the transmit FIFO
    pub fn clear_tx(&self) -> Result<()> {
        self.require(Direction::Write)?;
        self.state.lock(|s| s.borrow_mut().backend.clear(Direction::Write));
        Ok(())
    }

    pub fn start_rx(&self) -> Result<()> {
        self.set_enabled(Direction::Read, true)
    }

    pub fn stop_rx(&self) -> Result<()> {
        self.set_enabled(Direction::Read, false)
    }

    /// Flush the receive FIFO
    pub fn clear_rx(&self) -> Result<()> {
        self.require(Direction::Read)?;
        self.state.lock(|s| s.borrow_mut().backend.clear(Direction::Read));
        Ok(())
    }

    pub fn is_tx_enabled(&self) -> Result<bool> {
        self.require(Direction::Write)?;
        Ok(self.state.lock(|s| s.borrow().tx_enabled))
    }

    /// Transmit half is running and still has samples to send
    pub fn is_tx_busy(&self) -> Result<bool> {
        self.require(Direction::Write)?;
        let draining = self.state.lock(|s| {
            let s = s.borrow();
            s.tx_enabled && s.backend.tx_busy()
        });
        Ok(draining || self.transfers.is_pending(Direction::Write))
    }

    pub fn is_rx_enabled(&self) -> Result<bool> {
        self.require(Direction::Read)?;
        Ok(self.state.lock(|s| s.borrow().rx_enabled))
    }

    /// Receive half has an async read outstanding
    pub fn is_rx_busy(&self) -> Result<bool> {
        self.require(Direction::Read)?;
        Ok(self.transfers.is_pending(Direction::Read))
    }

    /// Blocking read of `buf.len()` samples
    pub fn read<D: DelayNs>(&self, buf: &mut [u32], delay: &mut D, timeout_ms: u32) -> Result<usize> {
        self.require(Direction::Read)?;
        if self.transfers.is_pending(Direction::Read) {
            return Err(I2sError::Busy.into());
        }
        let mut filled = 0;
        poll_until(delay, timeout_ms, POLL_INTERVAL_US, I2sError::Timeout.into(), || {
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                while filled < buf.len() {
                    let Some(sample) = s.backend.pop() else { break };
                    buf[filled] = sample;
                    filled += 1;
                }
                Ok((filled == buf.len()).then_some(filled))
            })
        })
    }

    /// Blocking write of every sample in `data`
    pub fn write<D: DelayNs>(&self, data: &[u32], delay: &mut D, timeout_ms: u32) -> Result<usize> {
        self.require(Direction::Write)?;
        if self.transfers.is_pending(Direction::Write) {
            return Err(I2sError::Busy.into());
        }
        let mut sent = 0;
        poll_until(delay, timeout_ms, POLL_INTERVAL_US, I2sError::Timeout.into(), || {
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                while sent < data.len() && s.backend.tx_free() > 0 {
                    s.backend.push(data[sent]);
                    sent += 1;
                }
                Ok((sent == data.len()).then_some(sent))
            })
        })
    }

    /// Start an async read of `len` samples
    pub fn read_async(&self, len: usize) -> Result<()> {
        self.require(Direction::Read)?;
        if len == 0 {
            return Err(I2sError::InvalidArgument.into());
        }
        self.transfers.begin::<I2sError>(Direction::Read, len)?;
        let started = self
            .state
            .lock(|s| s.borrow_mut().backend.start_read(len));
        if let Err(e) = started {
            self.transfers.rollback(Direction::Read);
            return Err(e.into());
        }
        Ok(())
    }

    /// Start an async write of `data`
    pub fn write_async(&self, data: &[u32]) -> Result<()> {
        self.require(Direction::Write)?;
        if data.is_empty() {
            return Err(I2sError::InvalidArgument.into());
        }
        self.transfers.begin::<I2sError>(Direction::Write, data.len())?;
        let started = self
            .state
            .lock(|s| s.borrow_mut().backend.start_write(data));
        if let Err(e) = started {
            self.transfers.rollback(Direction::Write);
            return Err(e.into());
        }
        Ok(())
    }

    /// Copy out the samples of the last async read
    pub fn take_read(&self, buf: &mut [u32]) -> Result<usize> {
        self.require(Direction::Read)?;
        if self.transfers.is_pending(Direction::Read) {
            return Err(I2sError::Busy.into());
        }
        Ok(self.state.lock(|s| s.borrow_mut().backend.take_read(buf)))
    }

    /// Choose how async transfers are fed; refused while one is pending
    pub fn set_async_mode(&self, mode: AsyncMode, priority: u8) -> Result<()> {
        self.claim.check::<I2sError>()?;
        if self.transfers.is_busy() {
            return Err(I2sError::Busy.into());
        }
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_async_mode(mode, priority)?;
            s.async_mode = mode;
            Ok(())
        })
    }

    pub fn async_mode(&self) -> Result<AsyncMode> {
        self.claim.check::<I2sError>()?;
        Ok(self.state.lock(|s| s.borrow().async_mode))
    }

    pub fn is_read_pending(&self) -> Result<bool> {
        self.claim.check::<I2sError>()?;
        Ok(self.transfers.is_pending(Direction::Read))
    }

    pub fn is_write_pending(&self) -> Result<bool> {
        self.claim.check::<I2sError>()?;
        Ok(self.transfers.is_pending(Direction::Write))
    }

    fn abort(&self, direction: Direction) -> Result<()> {
        self.claim.check::<I2sError>()?;
        if self.transfers.is_pending(direction) {
            self.state.lock(|s| s.borrow_mut().backend.cancel(direction));
            if self.transfers.abort(direction, &self.events) {
                debug!("i2s{}: async transfer aborted", self.block);
            }
        }
        Ok(())
    }

    /// Cancel the pending async read; no-op when idle
    pub fn abort_read_async(&self) -> Result<()> {
        self.abort(Direction::Read)
    }

    /// Cancel the pending async write; no-op when idle
    pub fn abort_write_async(&self) -> Result<()> {
        self.abort(Direction::Write)
    }

    pub async fn wait_read(&self) -> Result<TransferEvent> {
        self.claim.check::<I2sError>()?;
        self.transfers.wait::<I2sError>(Direction::Read).await.map_err(Into::into)
    }

    pub async fn wait_write(&self) -> Result<TransferEvent> {
        self.claim.check::<I2sError>()?;
        self.transfers.wait::<I2sError>(Direction::Write).await.map_err(Into::into)
    }

    pub fn register_callback(&self, handler: Option<&'static dyn EventHandler<I2sEvent>>) -> Result<()> {
        self.claim.check::<I2sError>()?;
        self.events.register(handler);
        Ok(())
    }

    pub fn enable_event(&self, event: I2sEvent, priority: u8, enable: bool) -> Result<()> {
        self.claim.check::<I2sError>()?;
        self.events.enable(event, priority, enable);
        let enabled = self.events.enabled();
        self.state.lock(|s| {
            s.borrow_mut()
                .backend
                .set_interrupts(enabled, self.events.priority())
        });
        Ok(())
    }

    /// Interrupt entry point for this block
    pub fn on_interrupt(&self) {
        if !self.claim.is_live() {
            return;
        }
        let serviced = self.state.lock(|s| s.borrow_mut().backend.service_interrupt());
        self.transfers.dispatch(serviced, &self.events);
    }

    /// Direct access to the register glue
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut().backend))
    }
}

impl<B: I2sBackend> Drop for I2s<'_, B> {
    fn drop(&mut self) {
        let _ = self.free();
    }
}
