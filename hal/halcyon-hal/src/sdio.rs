//! SDIO device driver
//!
//! The part only acts as an SDIO device: the host owns the bus, and data
//! moves in frames the host pulls (write) or pushes (read). Nothing can
//! move until [`Sdio::configure`] brought the core up and the host enabled
//! the I/O function, which [`Sdio::is_ready`] checks and latches.
//!
//! Blocking `read`/`write` are async transfers polled every millisecond.

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

/// Poll interval for blocking calls
pub const POLL_INTERVAL_US: u32 = 1_000;

/// Largest frame payload in either direction
pub const MAX_FRAME_PAYLOAD: usize = 1536;

peripheral_error! {
    /// SDIO status
    pub enum SdioError {
        InvalidPin = 0x10 => InvalidArgument,
        /// Core not configured or host has not enabled I/O
        NotReady = 0x11 => NotInitialized,
        FrameTooLarge = 0x12 => InvalidArgument,
        MailboxWrite = 0x13 => TransferError,
        MailboxRead = 0x14 => TransferError,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SdioPins {
    pub cmd: u8,
    pub clk: u8,
    pub data: [u8; 4],
}

impl SdioPins {
    fn iter(&self) -> impl Iterator<Item = u8> {
        [self.cmd, self.clk].into_iter().chain(self.data)
    }
}

/// Which side of the bus this block plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SdioRole {
    Host,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SdioConfig {
    pub frequency_hz: u32,
    pub block_size: u16,
    pub role: SdioRole,
}

impl Default for SdioConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 25_000_000,
            block_size: 512,
            role: SdioRole::Device,
        }
    }
}

impl SdioConfig {
    pub const MAX_FREQUENCY: u32 = 50_000_000;
    pub const MAX_BLOCK_SIZE: u16 = 512;

    pub fn validate(&self) -> Result<(), SdioError> {
        if self.frequency_hz == 0 || self.block_size == 0 {
            return Err(SdioError::InvalidArgument);
        }
        if self.frequency_hz > Self::MAX_FREQUENCY
            || self.block_size > Self::MAX_BLOCK_SIZE
            || self.role == SdioRole::Host
        {
            return Err(SdioError::Unsupported);
        }
        Ok(())
    }
}

event_flags! {
    /// SDIO device conditions
    pub struct SdioEvent: u32 {
        /// Host wrote the mailbox or signalled the device
        const HOST_INFO = 1 << 0;
        const READ_COMPLETE = 1 << 1;
        const WRITE_COMPLETE = 1 << 2;
        const READ_ERROR = 1 << 3;
        const WRITE_ERROR = 1 << 4;
        const ALL = Self::HOST_INFO.bits()
            | Self::READ_COMPLETE.bits()
            | Self::WRITE_COMPLETE.bits()
            | Self::READ_ERROR.bits()
            | Self::WRITE_ERROR.bits();
    }
}

impl EventFlags for SdioEvent {
    fn completion(direction: Direction, outcome: &TransferEvent) -> Self {
        match (direction, outcome) {
            (Direction::Read, TransferEvent::Complete { .. }) => SdioEvent::READ_COMPLETE,
            (Direction::Read, TransferEvent::Error { .. }) => SdioEvent::READ_ERROR,
            (Direction::Write, TransferEvent::Complete { .. }) => SdioEvent::WRITE_COMPLETE,
            (Direction::Write, TransferEvent::Error { .. }) => SdioEvent::WRITE_ERROR,
            (_, TransferEvent::Aborted) => SdioEvent::empty(),
        }
    }
}

/// Register glue for the SDIO device core
pub trait SdioBackend {
    fn connect(&mut self, pins: &SdioPins) -> Result<(), SdioError>;

    fn disconnect(&mut self);

    /// Bring the core up with `config`
    fn apply(&mut self, config: &SdioConfig) -> Result<(), SdioError>;

    /// Host has enabled the I/O function
    fn host_io_enabled(&self) -> bool;

    /// Tell the host the function is ready
    fn set_io_ready(&mut self) -> Result<(), SdioError>;

    /// Signal `bits` to the host, optionally with a data word
    fn mailbox_write(&mut self, bits: u32, data: Option<u32>) -> Result<(), SdioError>;

    fn mailbox_read(&mut self) -> Result<u32, SdioError>;

    /// Accept one frame of up to `len` bytes from the host
    fn start_read(&mut self, len: usize) -> Result<(), SdioError>;

    /// Offer one frame to the host
    fn start_write(&mut self, data: &[u8]) -> Result<(), SdioError>;

    fn cancel(&mut self, direction: Direction);

    /// Copy out the last received frame
    fn take_read(&mut self, buf: &mut [u8]) -> usize;

    fn set_interrupts(&mut self, enabled: bool);

    fn service_interrupt(&mut self) -> Serviced<SdioEvent>;
}

struct State<B> {
    backend: B,
    config: Option<SdioConfig>,
    ready: bool,
}

/// The claimed SDIO device block
pub struct Sdio<'a, B: SdioBackend> {
    claim: Claim<'a>,
    state: Mutex<CriticalSectionRawMutex, RefCell<State<B>>>,
    events: EventCore<SdioEvent>,
    transfers: Transfers,
}

impl<'a, B: SdioBackend> Sdio<'a, B> {
    /// Claim the block and route its pins
    ///
    /// The core stays down until [`Sdio::configure`].
    pub fn init(hw: &'a HwManager, mut backend: B, pins: SdioPins) -> Result<Self> {
        let pin_count = hw.layout().gpio.channels;
        if pins.iter().any(|p| p >= pin_count) {
            return Err(SdioError::InvalidPin.into());
        }
        let mut resources: Vec<Resource, 7> = Vec::new();
        let _ = resources.push(Resource::block(ResourceType::Sdio, 0));
        for pin in pins.iter() {
            let _ = resources.push(Resource::pin(pin));
        }
        let claim = Claim::acquire(hw, &resources)?;
        backend.connect(&pins)?;
        debug!("sdio: claimed");

        Ok(Self {
            claim,
            state: Mutex::new(RefCell::new(State {
                backend,
                config: None,
                ready: false,
            })),
            events: EventCore::new(),
            transfers: Transfers::new(),
        })
    }

    /// Configurator-based init is not available for this block
    pub fn init_cfg(_hw: &'a HwManager, _backend: B, _pins: SdioPins, _config: SdioConfig) -> Result<Self> {
        Err(SdioError::Unsupported.into())
    }

    pub fn free(&self) -> Result<()> {
        self.claim.check::<SdioError>()?;
        self.abort_async()?;
        self.events.clear();
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_interrupts(false);
            s.backend.disconnect();
            s.ready = false;
        });
        self.claim.release();
        debug!("sdio: freed");
        Ok(())
    }

    pub fn config(&self) -> Result<Option<SdioConfig>> {
        self.claim.check::<SdioError>()?;
        Ok(self.state.lock(|s| s.borrow().config))
    }

    /// Bring the device core up
    ///
    /// Only device role, up to 50 MHz and 512-byte blocks are supported.
    /// A rejected configuration leaves the previous one in place.
    pub fn configure(&self, config: SdioConfig) -> Result<()> {
        self.claim.check::<SdioError>()?;
        if let Err(e) = config.validate() {
            warn!("sdio: configuration rejected");
            return Err(e.into());
        }
        if self.transfers.is_busy() {
            return Err(SdioError::Busy.into());
        }
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.apply(&config)?;
            s.config = Some(config);
            Ok(())
        })
    }

    /// Whether the host has enabled I/O
    ///
    /// The first time it has, the device reports itself ready to the host;
    /// readiness then sticks until `free`.
    pub fn is_ready(&self) -> Result<bool> {
        self.claim.check::<SdioError>()?;
        Ok(self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if !s.ready && s.config.is_some() && s.backend.host_io_enabled() {
                s.ready = s.backend.set_io_ready().is_ok();
                if s.ready {
                    info!("sdio: host enabled I/O");
                }
            }
            s.ready
        }))
    }

    fn require_ready(&self) -> Result<()> {
        self.claim.check::<SdioError>()?;
        if self.state.lock(|s| s.borrow().ready) {
            Ok(())
        } else {
            Err(SdioError::NotReady.into())
        }
    }

    pub fn is_busy(&self) -> Result<bool> {
        self.claim.check::<SdioError>()?;
        Ok(self.transfers.is_busy())
    }

    /// Cancel both directions; no-op for idle ones
    pub fn abort_async(&self) -> Result<()> {
        self.claim.check::<SdioError>()?;
        for direction in [Direction::Read, Direction::Write] {
            if self.transfers.is_pending(direction) {
                self.state.lock(|s| s.borrow_mut().backend.cancel(direction));
                if self.transfers.abort(direction, &self.events) {
                    debug!("sdio: async transfer aborted");
                }
            }
        }
        Ok(())
    }

    /// Signal `bits` to the host, optionally with a data word
    pub fn mailbox_write(&self, bits: u32, data: Option<u32>) -> Result<()> {
        self.require_ready()?;
        self.state
            .lock(|s| s.borrow_mut().backend.mailbox_write(bits, data))?;
        Ok(())
    }

    /// Word most recently written by the host
    pub fn mailbox_read(&self) -> Result<u32> {
        self.require_ready()?;
        Ok(self.state.lock(|s| s.borrow_mut().backend.mailbox_read())?)
    }

    fn check_frame(&self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(SdioError::InvalidArgument.into());
        }
        if len > MAX_FRAME_PAYLOAD {
            return Err(SdioError::FrameTooLarge.into());
        }
        Ok(())
    }

    /// Accept one frame of up to `len` bytes from the host
    pub fn read_async(&self, len: usize) -> Result<()> {
        self.require_ready()?;
        self.check_frame(len)?;
        self.transfers.begin::<SdioError>(Direction::Read, len)?;
        let started = self.state.lock(|s| s.borrow_mut().backend.start_read(len));
        if let Err(e) = started {
            self.transfers.rollback(Direction::Read);
            return Err(e.into());
        }
        Ok(())
    }

    /// Offer one frame to the host
    pub fn write_async(&self, data: &[u8]) -> Result<()> {
        self.require_ready()?;
        self.check_frame(data.len())?;
        self.transfers.begin::<SdioError>(Direction::Write, data.len())?;
        let started = self.state.lock(|s| s.borrow_mut().backend.start_write(data));
        if let Err(e) = started {
            self.transfers.rollback(Direction::Write);
            return Err(e.into());
        }
        Ok(())
    }

    /// Copy out the last frame received from the host
    pub fn take_read(&self, buf: &mut [u8]) -> Result<usize> {
        self.claim.check::<SdioError>()?;
        if self.transfers.is_pending(Direction::Read) {
            return Err(SdioError::Busy.into());
        }
        Ok(self.state.lock(|s| s.borrow_mut().backend.take_read(buf)))
    }

    fn wait_polled<D: DelayNs>(
        &self,
        direction: Direction,
        delay: &mut D,
        timeout_ms: u32,
    ) -> Result<usize> {
        let outcome = poll_until(delay, timeout_ms, POLL_INTERVAL_US, Error::from(SdioError::Timeout), || {
            self.on_interrupt();
            Ok(self.transfers.try_outcome(direction))
        });
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("sdio: blocking transfer timed out");
                self.state.lock(|s| s.borrow_mut().backend.cancel(direction));
                self.transfers.abort(direction, &self.events);
                return Err(e);
            }
        };
        match outcome {
            TransferEvent::Complete { bytes } => Ok(bytes),
            TransferEvent::Error { .. } => Err(SdioError::TransferError.into()),
            TransferEvent::Aborted => Err(SdioError::Aborted.into()),
        }
    }

    /// Blocking read of one frame into `buf`
    ///
    /// Polls every millisecond for up to `timeout_ms`; 0 waits forever.
    pub fn read<D: DelayNs>(&self, buf: &mut [u8], delay: &mut D, timeout_ms: u32) -> Result<usize> {
        self.read_async(buf.len())?;
        self.wait_polled(Direction::Read, delay, timeout_ms)?;
        self.take_read(buf)
    }

    /// Blocking write of one frame
    pub fn write<D: DelayNs>(&self, data: &[u8], delay: &mut D, timeout_ms: u32) -> Result<usize> {
        self.write_async(data)?;
        self.wait_polled(Direction::Write, delay, timeout_ms)
    }

    pub async fn wait_read(&self) -> Result<TransferEvent> {
        self.claim.check::<SdioError>()?;
        self.transfers.wait::<SdioError>(Direction::Read).await.map_err(Into::into)
    }

    pub async fn wait_write(&self) -> Result<TransferEvent> {
        self.claim.check::<SdioError>()?;
        self.transfers.wait::<SdioError>(Direction::Write).await.map_err(Into::into)
    }

    pub fn register_callback(&self, handler: Option<&'static dyn EventHandler<SdioEvent>>) -> Result<()> {
        self.claim.check::<SdioError>()?;
        self.events.register(handler);
        Ok(())
    }

    /// Enable or disable events
    ///
    /// The core interrupt stays on while any event is enabled. Priority is
    /// fixed by the core and ignored.
    pub fn enable_event(&self, event: SdioEvent, priority: u8, enable: bool) -> Result<()> {
        self.claim.check::<SdioError>()?;
        self.events.enable(event, priority, enable);
        let any = !self.events.enabled().is_empty();
        self.state.lock(|s| s.borrow_mut().backend.set_interrupts(any));
        Ok(())
    }

    /// Interrupt entry point for the core
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

impl<B: SdioBackend> Drop for Sdio<'_, B> {
    fn drop(&mut self) {
        let _ = self.free();
    }
}
