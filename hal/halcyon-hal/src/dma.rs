//! DMA channels
//!
//! A handle is created for one transfer direction and owns no controller
//! channel until it is configured. The channel then follows from where the
//! source and destination addresses sit in the chip's [`DmaAddressMap`]:
//!
//! | route                   | channel |
//! |-------------------------|---------|
//! | memory to memory        | 1       |
//! | memory to SCB           | 1       |
//! | SCB to memory           | 2       |
//! | memory to TDM0 / TDM1   | 4 / 6   |
//! | TDM0 / TDM1 to memory   | 5 / 7   |
//!
//! Two handles routing onto the same channel conflict; the second one
//! fails to configure with `InUse`.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::claim::Claim;
use crate::event::{event_flags, EventCore, EventFlags, EventHandler};
use crate::hwmgr::{HwManager, Resource, ResourceType};
use crate::result::{peripheral_error, Result};
use crate::transfer::{Direction, Serviced, TransferEvent, Transfers};

/// Elements one descriptor can move, exclusive
pub const MAX_LENGTH: u32 = 1 << 12;
/// Largest burst the controller accepts
pub const MAX_BURST: u32 = 256;

const BURST_SIZES: [u32; 8] = [1, 4, 8, 16, 32, 64, 128, 256];

pub const CH_MEM_TO_MEM: u8 = 1;
pub const CH_MEM_TO_PERIPH: u8 = 1;
pub const CH_PERIPH_TO_MEM: u8 = 2;
pub const CH_MEM_TO_TDM: [u8; 2] = [4, 6];
pub const CH_TDM_TO_MEM: [u8; 2] = [5, 7];

peripheral_error! {
    /// DMA status
    pub enum DmaError {
        /// Width other than 8, 16 or 32 bits
        InvalidTransferWidth = 0x10 => InvalidArgument,
        /// Length of 4096 elements or more
        InvalidTransferSize = 0x11 => InvalidArgument,
        InvalidBurstSize = 0x12 => InvalidArgument,
        /// Addresses do not match a channel for the handle's direction
        NoRoute = 0x13 => InvalidArgument,
        /// Transfer requested before `configure`
        NotConfigured = 0x14 => NotInitialized,
        /// Transfer requested on a disabled channel
        ChannelDisabled = 0x15 => NotInitialized,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DmaDirection {
    MemToMem,
    MemToPeriph,
    PeriphToMem,
    PeriphToPeriph,
}

/// What one start request moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TransferAction {
    /// The whole descriptor
    Full,
    /// One burst per trigger
    Burst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DmaConfig {
    pub src_addr: u32,
    pub src_increment: bool,
    pub dst_addr: u32,
    pub dst_increment: bool,
    /// Element width in bits
    pub transfer_width: u8,
    /// Elements to move
    pub length: u32,
    /// Elements per burst; 0 means 1
    pub burst_size: u32,
    pub action: TransferAction,
}

impl DmaConfig {
    pub fn validate(&self) -> Result<(), DmaError> {
        if !matches!(self.transfer_width, 8 | 16 | 32) {
            return Err(DmaError::InvalidTransferWidth);
        }
        if self.length >= MAX_LENGTH {
            return Err(DmaError::InvalidTransferSize);
        }
        if !BURST_SIZES.contains(&self.burst()) {
            return Err(DmaError::InvalidBurstSize);
        }
        if self.action == TransferAction::Burst {
            return Err(DmaError::Unsupported);
        }
        Ok(())
    }

    /// Burst size with 0 read as 1
    pub fn burst(&self) -> u32 {
        self.burst_size.max(1)
    }

    /// Bytes moved by one full transfer
    pub fn total_bytes(&self) -> usize {
        self.length as usize * usize::from(self.transfer_width / 8)
    }
}

/// Half-open address window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AddrRange {
    pub start: u32,
    pub end: u32,
}

impl AddrRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Which side of a transfer an address falls on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Endpoint {
    Memory,
    Scb(u8),
    Tdm(u8),
}

/// Address windows used to route transfers onto channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DmaAddressMap {
    pub sram: AddrRange,
    pub scb: [AddrRange; 3],
    pub tdm: [AddrRange; 2],
}

impl Default for DmaAddressMap {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl DmaAddressMap {
    /// Map of the reference part
    pub const DEFAULT: Self = Self {
        sram: AddrRange::new(0x0020_0000, 0x0028_0000),
        scb: [
            AddrRange::new(0x0040_0000, 0x0040_1000),
            AddrRange::new(0x0040_1000, 0x0040_2000),
            AddrRange::new(0x0040_2000, 0x0040_3000),
        ],
        tdm: [
            AddrRange::new(0x0041_0000, 0x0041_1000),
            AddrRange::new(0x0041_1000, 0x0041_2000),
        ],
    };

    pub fn classify(&self, addr: u32) -> Option<Endpoint> {
        if self.sram.contains(addr) {
            return Some(Endpoint::Memory);
        }
        if let Some(n) = self.scb.iter().position(|r| r.contains(addr)) {
            return Some(Endpoint::Scb(n as u8));
        }
        self.tdm
            .iter()
            .position(|r| r.contains(addr))
            .map(|n| Endpoint::Tdm(n as u8))
    }

    /// Controller channel for a transfer, if the addresses fit `direction`
    pub fn route(&self, direction: DmaDirection, src: u32, dst: u32) -> Option<u8> {
        let src = self.classify(src)?;
        let dst = self.classify(dst)?;
        match (direction, src, dst) {
            (DmaDirection::MemToMem, Endpoint::Memory, Endpoint::Memory) => Some(CH_MEM_TO_MEM),
            (DmaDirection::MemToPeriph, Endpoint::Memory, Endpoint::Scb(_)) => Some(CH_MEM_TO_PERIPH),
            (DmaDirection::MemToPeriph, Endpoint::Memory, Endpoint::Tdm(n)) => {
                CH_MEM_TO_TDM.get(usize::from(n)).copied()
            }
            (DmaDirection::PeriphToMem, Endpoint::Scb(_), Endpoint::Memory) => Some(CH_PERIPH_TO_MEM),
            (DmaDirection::PeriphToMem, Endpoint::Tdm(n), Endpoint::Memory) => {
                CH_TDM_TO_MEM.get(usize::from(n)).copied()
            }
            _ => None,
        }
    }
}

/// A validated configuration bound to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaProgram {
    pub channel: u8,
    pub direction: DmaDirection,
    pub config: DmaConfig,
}

event_flags! {
    /// DMA interrupt conditions
    pub struct DmaEvent: u32 {
        const TRANSFER_COMPLETE = 1 << 0;
        const GENERIC_ERROR = 1 << 1;
    }
}

impl EventFlags for DmaEvent {
    fn completion(_direction: Direction, outcome: &TransferEvent) -> Self {
        match outcome {
            TransferEvent::Complete { .. } => DmaEvent::TRANSFER_COMPLETE,
            TransferEvent::Error { .. } => DmaEvent::GENERIC_ERROR,
            TransferEvent::Aborted => DmaEvent::empty(),
        }
    }
}

/// Register glue for one controller channel
pub trait DmaBackend {
    /// Load a descriptor; replaces any earlier program
    fn program(&mut self, program: &DmaProgram) -> Result<(), DmaError>;

    /// Forget the channel
    fn release(&mut self);

    fn set_enabled(&mut self, enable: bool);

    /// Queue the programmed transfer
    fn start(&mut self) -> Result<(), DmaError>;

    /// Stop an in-flight transfer
    fn kill(&mut self);

    fn set_interrupts(&mut self, events: DmaEvent, priority: u8);

    /// Read and clear pending conditions; a finished transfer is reported
    /// in the write slot
    fn service_interrupt(&mut self) -> Serviced<DmaEvent>;
}

struct State<B> {
    backend: B,
    map: DmaAddressMap,
    program: Option<DmaProgram>,
    enabled: bool,
}

/// A DMA handle
pub struct Dma<'a, B: DmaBackend> {
    claim: Claim<'a>,
    direction: DmaDirection,
    state: Mutex<CriticalSectionRawMutex, RefCell<State<B>>>,
    events: EventCore<DmaEvent>,
    transfers: Transfers,
}

impl<'a, B: DmaBackend> Dma<'a, B> {
    pub fn init(hw: &'a HwManager, backend: B, direction: DmaDirection) -> Result<Self> {
        Self::init_with_map(hw, backend, direction, DmaAddressMap::DEFAULT)
    }

    /// Handle that routes with a chip-specific address map
    pub fn init_with_map(
        hw: &'a HwManager,
        backend: B,
        direction: DmaDirection,
        map: DmaAddressMap,
    ) -> Result<Self> {
        if direction == DmaDirection::PeriphToPeriph {
            return Err(DmaError::Unsupported.into());
        }
        let claim = Claim::acquire(hw, &[])?;
        Ok(Self {
            claim,
            direction,
            state: Mutex::new(RefCell::new(State {
                backend,
                map,
                program: None,
                enabled: false,
            })),
            events: EventCore::new(),
            transfers: Transfers::new(),
        })
    }

    /// Configurator-based setup is not available on this part
    pub fn init_cfg(_hw: &'a HwManager, _backend: B) -> Result<Self> {
        Err(DmaError::Unsupported.into())
    }

    pub fn free(&self) -> Result<()> {
        self.claim.check::<DmaError>()?;
        self.abort_in_flight();
        self.events.clear();
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_interrupts(DmaEvent::empty(), 0);
            s.backend.set_enabled(false);
            s.backend.release();
            s.enabled = false;
            s.program = None;
        });
        self.claim.release();
        debug!("dma: freed");
        Ok(())
    }

    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    /// Channel picked by the last successful `configure`
    pub fn channel(&self) -> Result<Option<u8>> {
        self.claim.check::<DmaError>()?;
        Ok(self.state.lock(|s| s.borrow().program.map(|p| p.channel)))
    }

    pub fn config(&self) -> Result<Option<DmaConfig>> {
        self.claim.check::<DmaError>()?;
        Ok(self.state.lock(|s| s.borrow().program.map(|p| p.config)))
    }

    /// Validate, route and program a transfer
    ///
    /// The channel is reserved here. On any error the previous
    /// configuration and channel stay in place.
    pub fn configure(&self, config: &DmaConfig) -> Result<()> {
        self.claim.check::<DmaError>()?;
        if self.transfers.is_busy() {
            return Err(DmaError::Busy.into());
        }
        config.validate()?;

        let (map, previous) = self.state.lock(|s| {
            let s = s.borrow();
            (s.map, s.program.map(|p| p.channel))
        });
        let Some(channel) = map.route(self.direction, config.src_addr, config.dst_addr) else {
            warn!("dma: no channel for {:x} -> {:x}", config.src_addr, config.dst_addr);
            return Err(DmaError::NoRoute.into());
        };

        let res = Resource::channel(ResourceType::Dma, 0, channel);
        let moved = previous != Some(channel);
        if moved {
            self.claim.add(res)?;
        }

        let program = DmaProgram {
            channel,
            direction: self.direction,
            config: DmaConfig {
                burst_size: config.burst(),
                ..*config
            },
        };
        let programmed = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.program(&program)?;
            s.program = Some(program);
            Ok::<_, DmaError>(())
        });
        if let Err(e) = programmed {
            if moved {
                let _ = self.claim.remove(res);
            }
            return Err(e.into());
        }

        if let Some(old) = previous.filter(|_| moved) {
            self.claim
                .remove(Resource::channel(ResourceType::Dma, 0, old))?;
        }
        debug!("dma: configured on channel {}", channel);
        Ok(())
    }

    pub fn enable(&self) -> Result<()> {
        self.claim.check::<DmaError>()?;
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_enabled(true);
            s.enabled = true;
        });
        Ok(())
    }

    /// Disable the channel, ending any in-flight transfer as aborted
    pub fn disable(&self) -> Result<()> {
        self.claim.check::<DmaError>()?;
        self.abort_in_flight();
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.backend.set_enabled(false);
            s.enabled = false;
        });
        Ok(())
    }

    pub fn is_enabled(&self) -> Result<bool> {
        self.claim.check::<DmaError>()?;
        Ok(self.state.lock(|s| s.borrow().enabled))
    }

    /// Start the configured transfer
    ///
    /// Completion is reported through the handler and [`Self::wait_transfer`].
    pub fn start_transfer(&self) -> Result<()> {
        self.claim.check::<DmaError>()?;
        let (program, enabled) = self.state.lock(|s| {
            let s = s.borrow();
            (s.program, s.enabled)
        });
        let Some(program) = program else {
            return Err(DmaError::NotConfigured.into());
        };
        if !enabled {
            return Err(DmaError::ChannelDisabled.into());
        }
        if let Err(e) = self
            .transfers
            .begin::<DmaError>(Direction::Write, program.config.total_bytes())
        {
            debug!("dma: channel {} already running", program.channel);
            return Err(e.into());
        }
        if let Err(e) = self.state.lock(|s| s.borrow_mut().backend.start()) {
            self.transfers.rollback(Direction::Write);
            return Err(e.into());
        }
        trace!("dma: channel {} started", program.channel);
        Ok(())
    }

    pub fn is_busy(&self) -> Result<bool> {
        self.claim.check::<DmaError>()?;
        Ok(self.transfers.is_busy())
    }

    /// Wait for the running transfer to settle
    pub async fn wait_transfer(&self) -> Result<TransferEvent> {
        self.claim.check::<DmaError>()?;
        self.transfers.wait::<DmaError>(Direction::Write).await.map_err(Into::into)
    }

    pub fn register_callback(&self, handler: Option<&'static dyn EventHandler<DmaEvent>>) -> Result<()> {
        self.claim.check::<DmaError>()?;
        self.events.register(handler);
        Ok(())
    }

    pub fn enable_event(&self, event: DmaEvent, priority: u8, enable: bool) -> Result<()> {
        self.claim.check::<DmaError>()?;
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
        let serviced = self.state.lock(|s| s.borrow_mut().backend.service_interrupt());
        self.transfers.dispatch(serviced, &self.events);
    }

    /// Direct access to the register glue
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut().backend))
    }

    fn abort_in_flight(&self) {
        if self.transfers.is_pending(Direction::Write) {
            self.state.lock(|s| s.borrow_mut().backend.kill());
            if self.transfers.abort(Direction::Write, &self.events) {
                debug!("dma: transfer killed");
            }
        }
    }
}

impl<B: DmaBackend> Drop for Dma<'_, B> {
    fn drop(&mut self) {
        let _ = self.free();
    }
}
