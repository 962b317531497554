//! SPI driver
//!
//! Master or slave on one serial communication block. Blocking calls move
//! data through the FIFOs directly; `transfer_async` hands the buffers to
//! the backend and reports through the event handler once the interrupt
//! path sees the transfer finish.

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
use crate::result::{peripheral_error, Error, Result};
use crate::transfer::{Direction, Serviced, TransferEvent, Transfers};

/// FIFO poll interval for blocking calls
pub const POLL_INTERVAL_US: u32 = 10;

/// Additional slave-select lines per block
pub const MAX_SLAVE_SELECTS: usize = 4;

/// Frame clocked out by `recv` in master mode
const RECV_FILL: u32 = u32::MAX;

peripheral_error! {
    /// SPI status
    pub enum SpiError {
        InvalidPin = 0x10 => InvalidArgument,
        InvalidFrequency = 0x11 => InvalidArgument,
        InvalidDataBits = 0x12 => InvalidArgument,
        /// Slave mode without a slave-select pin
        SlaveSelectRequired = 0x13 => InvalidArgument,
        TooManySlaveSelects = 0x14 => InvalidArgument,
        /// Pin was never configured as a slave select
        UnknownSlaveSelect = 0x15 => InvalidArgument,
    }
}

pub use embedded_hal::spi::{Phase, Polarity};

/// Clock mode programmed into the block
///
/// The numbering is the one the block's `CPOL`/`CPHA` pair encodes, so a
/// mode survives a round trip through the control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Mode {
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

impl Mode {
    /// Mode for a raw `CPOL << 1 | CPHA` field; upper bits ignored
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Mode::Mode0,
            1 => Mode::Mode1,
            2 => Mode::Mode2,
            _ => Mode::Mode3,
        }
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }
}

impl From<Mode> for embedded_hal::spi::Mode {
    fn from(mode: Mode) -> Self {
        let polarity = if mode.bits() & 0b10 == 0 {
            Polarity::IdleLow
        } else {
            Polarity::IdleHigh
        };
        let phase = if mode.bits() & 0b01 == 0 {
            Phase::CaptureOnFirstTransition
        } else {
            Phase::CaptureOnSecondTransition
        };
        embedded_hal::spi::Mode { polarity, phase }
    }
}

impl From<embedded_hal::spi::Mode> for Mode {
    fn from(mode: embedded_hal::spi::Mode) -> Self {
        let cpol = u8::from(mode.polarity == Polarity::IdleHigh);
        let cpha = u8::from(mode.phase == Phase::CaptureOnSecondTransition);
        Mode::from_bits(cpol << 1 | cpha)
    }
}

/// Bit order on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

/// Active level of a slave-select line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SselPolarity {
    ActiveLow,
    ActiveHigh,
}

/// SPI configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpiConfig {
    /// Clock frequency in Hz
    pub frequency: u32,
    pub mode: Mode,
    pub bit_order: BitOrder,
    /// Bits per frame
    pub data_bits: u8,
    pub is_slave: bool,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            frequency: 1_000_000, // 1 MHz
            mode: Mode::Mode0,
            bit_order: BitOrder::MsbFirst,
            data_bits: 8,
            is_slave: false,
        }
    }
}

impl SpiConfig {
    pub const MIN_FREQUENCY: u32 = 1_000_000;
    pub const MAX_FREQUENCY: u32 = 25_000_000;

    pub fn validate(&self) -> Result<(), SpiError> {
        if !(Self::MIN_FREQUENCY..=Self::MAX_FREQUENCY).contains(&self.frequency) {
            return Err(SpiError::InvalidFrequency);
        }
        if !(4..=32).contains(&self.data_bits) {
            return Err(SpiError::InvalidDataBits);
        }
        Ok(())
    }

    /// Bytes each frame occupies in caller buffers (little-endian)
    pub fn frame_bytes(&self) -> usize {
        (self.data_bits as usize).div_ceil(8)
    }

    /// Bits of a frame word that go on the wire
    pub fn frame_mask(&self) -> u32 {
        if self.data_bits >= 32 {
            u32::MAX
        } else {
            (1 << self.data_bits) - 1
        }
    }
}

/// Pins used by one SPI block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpiPins {
    pub sclk: u8,
    pub mosi: Option<u8>,
    pub miso: Option<u8>,
    /// Primary slave select, active low
    pub ssel: Option<u8>,
}

impl SpiPins {
    fn iter(&self) -> impl Iterator<Item = u8> {
        [Some(self.sclk), self.mosi, self.miso, self.ssel]
            .into_iter()
            .flatten()
    }

    fn validate(&self, config: &SpiConfig, pin_count: u8) -> Result<(), SpiError> {
        if self.iter().any(|p| p >= pin_count) {
            return Err(SpiError::InvalidPin);
        }
        if self.mosi.is_none() && self.miso.is_none() {
            return Err(SpiError::InvalidPin);
        }
        if config.is_slave && self.ssel.is_none() {
            return Err(SpiError::SlaveSelectRequired);
        }
        Ok(())
    }
}

/// Everything `init_cfg` needs in one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpiInit {
    pub block: u8,
    pub pins: SpiPins,
    pub config: SpiConfig,
}

event_flags! {
    /// SPI interrupt conditions
    pub struct SpiEvent: u32 {
        /// Receive FIFO reached the configured level
        const DATA_IN_FIFO = 1 << 0;
        /// Async transfer finished
        const DONE = 1 << 1;
        /// Async transfer failed
        const ERROR = 1 << 2;
    }
}

impl EventFlags for SpiEvent {
    fn completion(_direction: Direction, outcome: &TransferEvent) -> Self {
        match outcome {
            TransferEvent::Complete { .. } => SpiEvent::DONE,
            TransferEvent::Error { .. } => SpiEvent::ERROR,
            TransferEvent::Aborted => SpiEvent::empty(),
        }
    }
}

/// Register glue for one serial communication block in SPI mode
pub trait SpiBackend {
    /// Route the bus pins of `block`
    fn connect(&mut self, block: u8, pins: &SpiPins) -> Result<(), SpiError>;

    fn disconnect(&mut self);

    /// Program clock, mode and frame format
    ///
    /// Must leave the previous settings in place on error.
    fn apply(&mut self, config: &SpiConfig) -> Result<(), SpiError>;

    /// Route an additional slave-select line
    fn connect_ssel(&mut self, pin: u8, polarity: SselPolarity) -> Result<(), SpiError>;

    fn disconnect_ssel(&mut self, pin: u8);

    /// Drive `pin` as the slave select for following transfers
    fn select(&mut self, pin: u8, polarity: SselPolarity);

    /// Free entries in the transmit FIFO
    fn tx_free(&self) -> usize;

    /// Frames waiting in the receive FIFO
    fn rx_available(&self) -> usize;

    fn push(&mut self, frame: u32);

    fn pop(&mut self) -> Option<u32>;

    fn clear_fifos(&mut self);

    /// Receive FIFO level that raises `DATA_IN_FIFO`
    fn set_fifo_level(&mut self, level: u8) -> Result<(), SpiError>;

    /// Hardware conditions the block should interrupt on
    fn set_interrupts(&mut self, events: SpiEvent, priority: u8);

    /// Start an interrupt-driven transfer
    ///
    /// Clocks out `tx`, padded with `fill` up to `rx_len` bytes, and keeps
    /// what comes back for [`SpiBackend::take_received`].
    fn start_async(&mut self, tx: &[u8], rx_len: usize, fill: u8) -> Result<(), SpiError>;

    fn cancel_async(&mut self);

    /// Copy out what the last async transfer received
    fn take_received(&mut self, buf: &mut [u8]) -> usize;

    fn service_interrupt(&mut self) -> Serviced<SpiEvent>;
}

struct State<B> {
    backend: B,
    config: SpiConfig,
    extra_ssel: Vec<(u8, SselPolarity), MAX_SLAVE_SELECTS>,
    active_ssel: Option<u8>,
    fill: u8,
}

/// A claimed SPI block
pub struct Spi<'a, B: SpiBackend> {
    claim: Claim<'a>,
    block: u8,
    pins: SpiPins,
    state: Mutex<CriticalSectionRawMutex, RefCell<State<B>>>,
    events: EventCore<SpiEvent>,
    transfers: Transfers,
}

impl<'a, B: SpiBackend> Spi<'a, B> {
    /// Claim `block` with its pins
    ///
    /// The clock starts at the default 1 MHz, MSB first.
    pub fn init(
        hw: &'a HwManager,
        backend: B,
        block: u8,
        pins: SpiPins,
        data_bits: u8,
        mode: Mode,
        is_slave: bool,
    ) -> Result<Self> {
        let config = SpiConfig {
            mode,
            data_bits,
            is_slave,
            ..SpiConfig::default()
        };
        Self::init_cfg(
            hw,
            backend,
            &SpiInit {
                block,
                pins,
                config,
            },
        )
    }

    /// Claim a block from a complete descriptor
    pub fn init_cfg(hw: &'a HwManager, mut backend: B, init: &SpiInit) -> Result<Self> {
        init.config.validate()?;
        init.pins.validate(&init.config, hw.layout().gpio.channels)?;

        let mut resources: Vec<Resource, 5> = Vec::new();
        let _ = resources.push(Resource::block(ResourceType::Scb, init.block));
        for pin in init.pins.iter() {
            let _ = resources.push(Resource::pin(pin));
        }
        let claim = Claim::acquire(hw, &resources)?;

        let routed = backend.connect(init.block, &init.pins);
        if let Err(e) = routed.and_then(|_| backend.apply(&init.config)) {
            warn!("spi{}: init rejected", init.block);
            backend.disconnect();
            return Err(e.into());
        }
        if let Some(ssel) = init.pins.ssel {
            backend.select(ssel, SselPolarity::ActiveLow);
        }
        debug!(
            "spi{}: claimed, {} Hz, {} bits",
            init.block,
            init.config.frequency,
            init.config.data_bits
        );

        Ok(Self {
            claim,
            block: init.block,
            pins: init.pins,
            state: Mutex::new(RefCell::new(State {
                backend,
                config: init.config,
                extra_ssel: Vec::new(),
                active_ssel: init.pins.ssel,
                fill: 0xFF,
            })),
            events: EventCore::new(),
            transfers: Transfers::new(),
        })
    }

    /// Release the block and its pins
    ///
    /// A pending async transfer is aborted first and reported as such.
    pub fn free(&self) -> Result<()> {
        self.claim.check::<SpiError>()?;
        self.abort_async()?;
        self.events.clear();
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_interrupts(SpiEvent::empty(), 0);
            let extra = core::mem::take(&mut s.extra_ssel);
            for (pin, _) in extra {
                s.backend.disconnect_ssel(pin);
            }
            s.backend.disconnect();
        });
        self.claim.release();
        debug!("spi{}: freed", self.block);
        Ok(())
    }

    pub fn block(&self) -> u8 {
        self.block
    }

    pub fn pins(&self) -> SpiPins {
        self.pins
    }

    pub fn config(&self) -> Result<SpiConfig> {
        self.claim.check::<SpiError>()?;
        Ok(self.state.lock(|s| s.borrow().config))
    }

    /// Apply a new configuration
    ///
    /// Rejected while an async transfer is pending. On any error the
    /// previous configuration stays in effect.
    pub fn configure(&self, config: SpiConfig) -> Result<()> {
        self.claim.check::<SpiError>()?;
        config.validate()?;
        if config.is_slave && self.pins.ssel.is_none() {
            return Err(SpiError::SlaveSelectRequired.into());
        }
        if self.transfers.is_busy() {
            return Err(SpiError::Busy.into());
        }
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.apply(&config)?;
            s.config = config;
            Ok(())
        })
    }

    pub fn set_frequency(&self, hz: u32) -> Result<()> {
        let config = SpiConfig {
            frequency: hz,
            ..self.config()?
        };
        self.configure(config)
    }

    /// Route an additional slave-select line
    pub fn slave_select_config(&self, pin: u8, polarity: SselPolarity) -> Result<()> {
        self.claim.check::<SpiError>()?;
        let full = self.state.lock(|s| s.borrow().extra_ssel.is_full());
        if full {
            return Err(SpiError::TooManySlaveSelects.into());
        }
        self.claim.add(Resource::pin(pin))?;
        let routed = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.connect_ssel(pin, polarity)?;
            let _ = s.extra_ssel.push((pin, polarity));
            Ok::<(), SpiError>(())
        });
        if let Err(e) = routed {
            let _ = self.claim.remove(Resource::pin(pin));
            return Err(e.into());
        }
        Ok(())
    }

    /// Choose which slave-select line following transfers drive
    pub fn select_active_ssel(&self, pin: u8) -> Result<()> {
        self.claim.check::<SpiError>()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let polarity = if self.pins.ssel == Some(pin) {
                SselPolarity::ActiveLow
            } else {
                s.extra_ssel
                    .iter()
                    .find(|(p, _)| *p == pin)
                    .map(|(_, polarity)| *polarity)
                    .ok_or(SpiError::UnknownSlaveSelect)?
            };
            s.backend.select(pin, polarity);
            s.active_ssel = Some(pin);
            Ok(())
        })
    }

    pub fn active_ssel(&self) -> Result<Option<u8>> {
        self.claim.check::<SpiError>()?;
        Ok(self.state.lock(|s| s.borrow().active_ssel))
    }

    fn idle_for_blocking(&self) -> Result<SpiConfig> {
        self.claim.check::<SpiError>()?;
        if self.transfers.is_pending(Direction::Write) {
            debug!("spi{}: blocking call while async transfer pending", self.block);
            return Err(SpiError::Busy.into());
        }
        Ok(self.state.lock(|s| s.borrow().config))
    }

    /// Receive one frame
    ///
    /// In master mode an all-ones frame is clocked out to read it.
    pub fn recv<D: DelayNs>(&self, delay: &mut D, timeout_ms: u32) -> Result<u32> {
        let config = self.idle_for_blocking()?;
        let mut pushed = config.is_slave;
        poll_until(delay, timeout_ms, POLL_INTERVAL_US, SpiError::Timeout.into(), || {
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                if !pushed && s.backend.tx_free() > 0 {
                    s.backend.push(RECV_FILL & config.frame_mask());
                    pushed = true;
                }
                Ok(if pushed { s.backend.pop() } else { None })
            })
        })
    }

    /// Send one frame
    ///
    /// In master mode the frame clocked in at the same time is discarded.
    pub fn send<D: DelayNs>(&self, frame: u32, delay: &mut D, timeout_ms: u32) -> Result<()> {
        let config = self.idle_for_blocking()?;
        let frame = frame & config.frame_mask();
        let mut pushed = false;
        poll_until(delay, timeout_ms, POLL_INTERVAL_US, SpiError::Timeout.into(), || {
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                if !pushed && s.backend.tx_free() > 0 {
                    s.backend.push(frame);
                    pushed = true;
                }
                if !pushed {
                    return Ok(None);
                }
                if config.is_slave {
                    return Ok(Some(()));
                }
                Ok(s.backend.pop().map(|_| ()))
            })
        })
    }

    /// Slave mode: fill `buf` from the receive FIFO
    pub fn slave_read<D: DelayNs>(
        &self,
        buf: &mut [u8],
        delay: &mut D,
        timeout_ms: u32,
    ) -> Result<usize> {
        let config = self.idle_for_blocking()?;
        if !config.is_slave {
            return Err(SpiError::Unsupported.into());
        }
        let width = config.frame_bytes();
        if buf.len() % width != 0 {
            return Err(SpiError::InvalidArgument.into());
        }
        let mut offset = 0;
        poll_until(delay, timeout_ms, POLL_INTERVAL_US, SpiError::Timeout.into(), || {
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                while offset < buf.len() {
                    let Some(frame) = s.backend.pop() else { break };
                    unpack(frame, &mut buf[offset..], width);
                    offset += width;
                }
                Ok((offset == buf.len()).then_some(offset))
            })
        })
    }

    /// Slave mode: queue `data` for the master to clock out
    pub fn slave_write<D: DelayNs>(
        &self,
        data: &[u8],
        delay: &mut D,
        timeout_ms: u32,
    ) -> Result<usize> {
        let config = self.idle_for_blocking()?;
        if !config.is_slave {
            return Err(SpiError::Unsupported.into());
        }
        let width = config.frame_bytes();
        if data.len() % width != 0 {
            return Err(SpiError::InvalidArgument.into());
        }
        let mut offset = 0;
        poll_until(delay, timeout_ms, POLL_INTERVAL_US, SpiError::Timeout.into(), || {
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                while offset < data.len() && s.backend.tx_free() > 0 {
                    let frame = pack(&data[offset..], width, 0);
                    s.backend.push(frame & config.frame_mask());
                    offset += width;
                }
                Ok((offset == data.len()).then_some(offset))
            })
        })
    }

    /// Frames waiting in the receive FIFO
    pub fn readable(&self) -> Result<usize> {
        self.claim.check::<SpiError>()?;
        Ok(self.state.lock(|s| s.borrow().backend.rx_available()))
    }

    /// Free entries in the transmit FIFO
    pub fn writable(&self) -> Result<usize> {
        self.claim.check::<SpiError>()?;
        Ok(self.state.lock(|s| s.borrow().backend.tx_free()))
    }

    /// Blocking full-duplex transfer (master only)
    ///
    /// Clocks `max(tx.len(), rx.len())` bytes. Past the end of `tx` the bus
    /// sends `write_fill`; received bytes past the end of `rx` are dropped.
    /// Frames wider than 8 bits take several little-endian bytes each.
    pub fn transfer<D: DelayNs>(
        &self,
        tx: &[u8],
        rx: &mut [u8],
        write_fill: u8,
        delay: &mut D,
        timeout_ms: u32,
    ) -> Result<()> {
        let config = self.idle_for_blocking()?;
        if config.is_slave {
            return Err(SpiError::Unsupported.into());
        }
        let width = config.frame_bytes();
        let len = tx.len().max(rx.len());
        if len % width != 0 {
            return Err(SpiError::InvalidArgument.into());
        }
        let frames = len / width;
        let (mut sent, mut received) = (0usize, 0usize);

        poll_until(delay, timeout_ms, POLL_INTERVAL_US, Error::from(SpiError::Timeout), || {
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                while sent < frames && s.backend.tx_free() > 0 {
                    let offset = sent * width;
                    let frame = pack(tx.get(offset..).unwrap_or(&[]), width, write_fill);
                    s.backend.push(frame & config.frame_mask());
                    sent += 1;
                }
                while received < sent {
                    let Some(frame) = s.backend.pop() else { break };
                    let offset = received * width;
                    if let Some(dst) = rx.get_mut(offset..) {
                        unpack(frame, dst, width);
                    }
                    received += 1;
                }
                Ok((received == frames).then_some(()))
            })
        })
    }

    /// Start an interrupt-driven transfer
    ///
    /// `rx_len` bytes are kept for [`Spi::take_received`]; `tx` is padded
    /// with 0xFF when shorter. Fails with `Busy` while a previous async
    /// transfer is pending.
    pub fn transfer_async(&self, tx: &[u8], rx_len: usize) -> Result<()> {
        self.claim.check::<SpiError>()?;
        let len = tx.len().max(rx_len);
        if len == 0 {
            return Err(SpiError::InvalidArgument.into());
        }
        if let Err(e) = self.transfers.begin::<SpiError>(Direction::Write, len) {
            debug!("spi{}: async transfer rejected, busy", self.block);
            return Err(e.into());
        }
        let started = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let fill = s.fill;
            s.backend.start_async(tx, rx_len, fill)
        });
        if let Err(e) = started {
            self.transfers.rollback(Direction::Write);
            return Err(e.into());
        }
        trace!("spi{}: async transfer of {} bytes", self.block, len);
        Ok(())
    }

    /// Copy out the bytes received by the last async transfer
    pub fn take_received(&self, buf: &mut [u8]) -> Result<usize> {
        self.claim.check::<SpiError>()?;
        if self.transfers.is_pending(Direction::Write) {
            return Err(SpiError::Busy.into());
        }
        Ok(self.state.lock(|s| s.borrow_mut().backend.take_received(buf)))
    }

    pub fn is_busy(&self) -> Result<bool> {
        self.claim.check::<SpiError>()?;
        Ok(self.transfers.is_busy())
    }

    /// Cancel the pending async transfer
    ///
    /// The handler sees it as aborted unless the hardware finished first.
    /// No-op when nothing is pending.
    pub fn abort_async(&self) -> Result<()> {
        self.claim.check::<SpiError>()?;
        if self.transfers.is_pending(Direction::Write) {
            self.state.lock(|s| s.borrow_mut().backend.cancel_async());
            if self.transfers.abort(Direction::Write, &self.events) {
                debug!("spi{}: async transfer aborted", self.block);
            }
        }
        Ok(())
    }

    /// Wait for the pending async transfer to settle
    pub async fn wait_transfer(&self) -> Result<TransferEvent> {
        self.claim.check::<SpiError>()?;
        self.transfers.wait::<SpiError>(Direction::Write).await.map_err(Into::into)
    }

    /// Replace the event handler; `None` unregisters
    pub fn register_callback(&self, handler: Option<&'static dyn EventHandler<SpiEvent>>) -> Result<()> {
        self.claim.check::<SpiError>()?;
        self.events.register(handler);
        Ok(())
    }

    pub fn enable_event(&self, event: SpiEvent, priority: u8, enable: bool) -> Result<()> {
        self.claim.check::<SpiError>()?;
        self.events.enable(event, priority, enable);
        let enabled = self.events.enabled();
        self.state.lock(|s| {
            s.borrow_mut()
                .backend
                .set_interrupts(enabled, self.events.priority())
        });
        Ok(())
    }

    /// Receive FIFO level that raises `DATA_IN_FIFO`
    pub fn set_fifo_level(&self, level: u8) -> Result<()> {
        self.claim.check::<SpiError>()?;
        self.state
            .lock(|s| s.borrow_mut().backend.set_fifo_level(level))?;
        Ok(())
    }

    /// Flush both FIFOs
    pub fn clear(&self) -> Result<()> {
        self.claim.check::<SpiError>()?;
        if self.transfers.is_busy() {
            return Err(SpiError::Busy.into());
        }
        self.state.lock(|s| s.borrow_mut().backend.clear_fifos());
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

impl<B: SpiBackend> Drop for Spi<'_, B> {
    fn drop(&mut self) {
        let _ = self.free();
    }
}

fn pack(bytes: &[u8], width: usize, fill: u8) -> u32 {
    (0..width).fold(0u32, |frame, k| {
        let byte = bytes.get(k).copied().unwrap_or(fill);
        frame | (u32::from(byte) << (8 * k))
    })
}

fn unpack(frame: u32, dst: &mut [u8], width: usize) {
    for (k, slot) in dst.iter_mut().take(width).enumerate() {
        *slot = (frame >> (8 * k)) as u8;
    }
}
