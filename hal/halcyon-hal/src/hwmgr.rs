//! Hardware resource manager
//!
//! Tracks which blocks, channels and pins are claimed. Every resource type
//! is laid out as `blocks x channels` and mapped onto one bit of a fixed
//! reservation bitset, so a pin is just channel `n` of the single GPIO block.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::result::{peripheral_error, Result};

/// Capacity of the reservation bitset
pub const MAX_RESOURCES: usize = 128;

const WORDS: usize = MAX_RESOURCES / 32;
const TYPE_COUNT: usize = 10;

peripheral_error! {
    /// Resource manager status
    pub enum HwmgrError {
        /// Resource outside the chip layout
        InvalidResource = 0x10 => InvalidArgument,
        /// Every instance of the requested type is claimed
        NoneFree = 0x11 => InUse,
        /// Layout does not fit the reservation bitset
        LayoutTooLarge = 0x12 => InvalidArgument,
    }
}

/// Kind of hardware resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ResourceType {
    /// Digital pin
    Gpio,
    /// Serial communication block (SPI)
    Scb,
    /// Audio serial block (I2S), one channel per direction
    Tdm,
    /// SDIO device block
    Sdio,
    /// Two-channel auxiliary timer
    T2Timer,
    /// Real-time clock
    Rtc,
    /// DMA controller channel
    Dma,
    /// PDM to PCM converter
    PdmPcm,
    /// Analog front end ADC, shared by DC measurement and the analog mic
    AdcMic,
    /// Low-power comparator, one channel per comparator
    Lpcomp,
}

impl ResourceType {
    pub const ALL: [ResourceType; TYPE_COUNT] = [
        ResourceType::Gpio,
        ResourceType::Scb,
        ResourceType::Tdm,
        ResourceType::Sdio,
        ResourceType::T2Timer,
        ResourceType::Rtc,
        ResourceType::Dma,
        ResourceType::PdmPcm,
        ResourceType::AdcMic,
        ResourceType::Lpcomp,
    ];

    const fn index(self) -> usize {
        match self {
            ResourceType::Gpio => 0,
            ResourceType::Scb => 1,
            ResourceType::Tdm => 2,
            ResourceType::Sdio => 3,
            ResourceType::T2Timer => 4,
            ResourceType::Rtc => 5,
            ResourceType::Dma => 6,
            ResourceType::PdmPcm => 7,
            ResourceType::AdcMic => 8,
            ResourceType::Lpcomp => 9,
        }
    }
}

/// One claimable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Resource {
    pub kind: ResourceType,
    pub block: u8,
    pub channel: u8,
}

impl Resource {
    /// A GPIO pin
    pub const fn pin(pin: u8) -> Self {
        Self::channel(ResourceType::Gpio, 0, pin)
    }

    /// A whole block of a single-channel type
    pub const fn block(kind: ResourceType, block: u8) -> Self {
        Self::channel(kind, block, 0)
    }

    pub const fn channel(kind: ResourceType, block: u8, channel: u8) -> Self {
        Self {
            kind,
            block,
            channel,
        }
    }
}

/// Blocks and channels per block for one resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TypeLayout {
    pub blocks: u8,
    pub channels: u8,
}

impl TypeLayout {
    pub const fn new(blocks: u8, channels: u8) -> Self {
        Self { blocks, channels }
    }

    const fn count(&self) -> usize {
        self.blocks as usize * self.channels as usize
    }
}

/// Resource counts for a chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ResourceLayout {
    pub gpio: TypeLayout,
    pub scb: TypeLayout,
    pub tdm: TypeLayout,
    pub sdio: TypeLayout,
    pub t2timer: TypeLayout,
    pub rtc: TypeLayout,
    pub dma: TypeLayout,
    pub pdmpcm: TypeLayout,
    pub adcmic: TypeLayout,
    pub lpcomp: TypeLayout,
}

impl Default for ResourceLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl ResourceLayout {
    /// Layout of the reference part
    pub const DEFAULT: Self = Self {
        gpio: TypeLayout::new(1, 53),
        scb: TypeLayout::new(3, 1),
        tdm: TypeLayout::new(1, 2),
        sdio: TypeLayout::new(1, 1),
        t2timer: TypeLayout::new(2, 1),
        rtc: TypeLayout::new(1, 1),
        dma: TypeLayout::new(1, 8),
        pdmpcm: TypeLayout::new(1, 1),
        adcmic: TypeLayout::new(1, 1),
        lpcomp: TypeLayout::new(1, 2),
    };

    pub const fn get(&self, kind: ResourceType) -> TypeLayout {
        match kind {
            ResourceType::Gpio => self.gpio,
            ResourceType::Scb => self.scb,
            ResourceType::Tdm => self.tdm,
            ResourceType::Sdio => self.sdio,
            ResourceType::T2Timer => self.t2timer,
            ResourceType::Rtc => self.rtc,
            ResourceType::Dma => self.dma,
            ResourceType::PdmPcm => self.pdmpcm,
            ResourceType::AdcMic => self.adcmic,
            ResourceType::Lpcomp => self.lpcomp,
        }
    }

    /// Total number of bits the layout needs
    pub const fn total(&self) -> usize {
        let mut total = 0;
        let mut i = 0;
        while i < TYPE_COUNT {
            total += self.get(ResourceType::ALL[i]).count();
            i += 1;
        }
        total
    }

    pub const fn validate(&self) -> Result<(), HwmgrError> {
        if self.total() > MAX_RESOURCES {
            Err(HwmgrError::LayoutTooLarge)
        } else {
            Ok(())
        }
    }

    const fn offsets(&self) -> [u16; TYPE_COUNT] {
        let mut offsets = [0u16; TYPE_COUNT];
        let mut next = 0usize;
        let mut i = 0;
        while i < TYPE_COUNT {
            offsets[i] = next as u16;
            next += self.get(ResourceType::ALL[i]).count();
            i += 1;
        }
        offsets
    }
}

#[derive(Debug, Clone, Copy)]
struct Bitset([u32; WORDS]);

impl Bitset {
    const fn new() -> Self {
        Self([0; WORDS])
    }

    fn get(&self, bit: usize) -> bool {
        self.0[bit / 32] & (1 << (bit % 32)) != 0
    }

    fn set(&mut self, bit: usize) {
        self.0[bit / 32] |= 1 << (bit % 32);
    }

    fn clear(&mut self, bit: usize) {
        self.0[bit / 32] &= !(1 << (bit % 32));
    }

    fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Arbiter for every claimable resource on the chip
///
/// All state sits behind a critical-section mutex, so one manager can be
/// shared by drivers running in thread and interrupt context alike.
pub struct HwManager {
    layout: ResourceLayout,
    offsets: [u16; TYPE_COUNT],
    used: Mutex<CriticalSectionRawMutex, RefCell<Bitset>>,
}

impl HwManager {
    /// Manager for the reference layout, usable in a `static`
    pub const fn new_default() -> Self {
        Self {
            layout: ResourceLayout::DEFAULT,
            offsets: ResourceLayout::DEFAULT.offsets(),
            used: Mutex::new(RefCell::new(Bitset::new())),
        }
    }

    /// Manager for a custom layout
    pub fn new(layout: ResourceLayout) -> Result<Self> {
        layout.validate()?;
        Ok(Self {
            layout,
            offsets: layout.offsets(),
            used: Mutex::new(RefCell::new(Bitset::new())),
        })
    }

    pub fn layout(&self) -> &ResourceLayout {
        &self.layout
    }

    fn bit(&self, res: Resource) -> Result<usize, HwmgrError> {
        let layout = self.layout.get(res.kind);
        if res.block >= layout.blocks || res.channel >= layout.channels {
            return Err(HwmgrError::InvalidResource);
        }
        Ok(self.offsets[res.kind.index()] as usize
            + res.block as usize * layout.channels as usize
            + res.channel as usize)
    }

    /// Claim a specific resource
    pub fn reserve(&self, res: Resource) -> Result<()> {
        let bit = self.bit(res)?;
        self.used.lock(|used| {
            let mut used = used.borrow_mut();
            if used.get(bit) {
                return Err(HwmgrError::InUse.into());
            }
            used.set(bit);
            Ok(())
        })
    }

    /// Release a resource
    ///
    /// Releasing a resource that is not reserved is a no-op.
    pub fn free(&self, res: Resource) -> Result<()> {
        let bit = self.bit(res)?;
        self.used.lock(|used| used.borrow_mut().clear(bit));
        Ok(())
    }

    /// Claim the first free instance of a type
    pub fn allocate(&self, kind: ResourceType) -> Result<Resource> {
        let layout = self.layout.get(kind);
        self.used.lock(|used| {
            let mut used = used.borrow_mut();
            for block in 0..layout.blocks {
                for channel in 0..layout.channels {
                    let res = Resource::channel(kind, block, channel);
                    let bit = self.bit(res)?;
                    if !used.get(bit) {
                        used.set(bit);
                        return Ok(res);
                    }
                }
            }
            Err(HwmgrError::NoneFree.into())
        })
    }

    pub fn is_reserved(&self, res: Resource) -> Result<bool> {
        let bit = self.bit(res)?;
        Ok(self.used.lock(|used| used.borrow().get(bit)))
    }

    /// Number of resources currently claimed
    pub fn reserved_count(&self) -> usize {
        self.used.lock(|used| used.borrow().count())
    }
}

impl Default for HwManager {
    fn default() -> Self {
        Self::new_default()
    }
}
