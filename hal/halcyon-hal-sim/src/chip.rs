//! Chip descriptions
//!
//! A description names the resource layout the hardware manager tracks,
//! the DMA address windows, the FIFO depths of the simulated blocks and
//! the pin routing table. It is read from TOML; every table is optional
//! and falls back to the reference part. A `routes` table replaces the
//! reference routing as a whole.
//!
//! ```toml
//! name = "reduced"
//! fifo_depth = 8
//!
//! [layout.scb]
//! blocks = 1
//! channels = 1
//! ```

use core::fmt;
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use halcyon_hal::dma::DmaAddressMap;
use halcyon_hal::{HwManager, ResourceLayout};

use crate::delay::{SimClock, SimDelay};
use crate::adc::{AnalogInputs, SimAdc};
use crate::comp::{CompInputs, SimComp};
use crate::dma::{DmaProbe, SimDma, SimMemory};
use crate::gpio::{GpioProbe, PortModel, SimGpio};
use crate::i2s::{I2sProbe, SimI2s};
use crate::pdmpcm::{MicSignal, SimPdmPcm};
use crate::routing::PinMap;
use crate::rtc::{RtcProbe, SimRtc};
use crate::sdio::{SdioProbe, SimSdio};
use crate::spi::{SimSpi, SpiProbe};
use crate::timer::{SimTimer, TimerProbe};

/// Errors loading a chip description
#[derive(Debug)]
pub enum ChipError {
    /// TOML parsing failed
    Parse(toml::de::Error),
    /// Layout rejected by the hardware manager
    Layout(halcyon_hal::Error),
    /// A FIFO depth of zero
    InvalidFifoDepth,
    /// SRAM window is empty or too large to simulate
    InvalidSram,
    /// A route names a pin the part does not have
    InvalidRoute(u8),
}

impl fmt::Display for ChipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChipError::Parse(e) => write!(f, "chip description: {e}"),
            ChipError::Layout(e) => write!(f, "resource layout rejected: {e:?}"),
            ChipError::InvalidFifoDepth => f.write_str("FIFO depth must be non-zero"),
            ChipError::InvalidSram => f.write_str("SRAM window is empty or larger than 16 MiB"),
            ChipError::InvalidRoute(pin) => write!(f, "route names pin {pin}, which the part lacks"),
        }
    }
}

impl std::error::Error for ChipError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChipError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for ChipError {
    fn from(e: toml::de::Error) -> Self {
        ChipError::Parse(e)
    }
}

const MAX_SRAM: u32 = 16 << 20;

/// Static description of a part
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChipDescription {
    pub name: String,
    pub layout: ResourceLayout,
    pub dma_map: DmaAddressMap,
    /// SPI FIFO depth in frames
    pub fifo_depth: usize,
    /// I2S FIFO depth in samples
    pub i2s_fifo_depth: usize,
    /// Which pin carries which signal
    pub routes: PinMap,
}

impl Default for ChipDescription {
    fn default() -> Self {
        Self {
            name: "reference".into(),
            layout: ResourceLayout::DEFAULT,
            dma_map: DmaAddressMap::DEFAULT,
            fifo_depth: 16,
            i2s_fifo_depth: 64,
            routes: PinMap::reference(),
        }
    }
}

impl ChipDescription {
    pub fn validate(&self) -> Result<(), ChipError> {
        self.layout
            .validate()
            .map_err(|e| ChipError::Layout(e.into()))?;
        if self.fifo_depth == 0 || self.i2s_fifo_depth == 0 {
            return Err(ChipError::InvalidFifoDepth);
        }
        let sram = self.dma_map.sram;
        if sram.end <= sram.start || sram.end - sram.start > MAX_SRAM {
            return Err(ChipError::InvalidSram);
        }
        let pins = self.layout.gpio.channels;
        if let Some(route) = self.routes.routes().iter().find(|r| r.pin >= pins) {
            return Err(ChipError::InvalidRoute(route.pin));
        }
        Ok(())
    }
}

/// A simulated part: one clock, one memory, one pin port
///
/// Hands out backends for the drivers together with probes that poke the
/// simulated hardware from outside.
pub struct SimChip {
    description: ChipDescription,
    clock: SimClock,
    memory: SimMemory,
    port: Arc<Mutex<PortModel>>,
}

impl SimChip {
    pub fn new(description: ChipDescription) -> Result<Self, ChipError> {
        description.validate()?;
        let sram = description.dma_map.sram;
        let memory = SimMemory::new(sram.start, (sram.end - sram.start) as usize);
        let pins = usize::from(description.layout.gpio.channels);
        Ok(Self {
            description,
            clock: SimClock::new(),
            memory,
            port: Arc::new(Mutex::new(PortModel::new(pins))),
        })
    }

    /// The reference part
    pub fn reference() -> Self {
        let description = ChipDescription::default();
        let sram = description.dma_map.sram;
        Self {
            memory: SimMemory::new(sram.start, (sram.end - sram.start) as usize),
            port: Arc::new(Mutex::new(PortModel::new(usize::from(
                description.layout.gpio.channels,
            )))),
            clock: SimClock::new(),
            description,
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ChipError> {
        let description: ChipDescription = toml::from_str(text)?;
        Self::new(description)
    }

    pub fn description(&self) -> &ChipDescription {
        &self.description
    }

    /// Fresh hardware manager for this part's layout
    pub fn hw_manager(&self) -> Result<HwManager, ChipError> {
        HwManager::new(self.description.layout).map_err(ChipError::Layout)
    }

    pub fn clock(&self) -> SimClock {
        self.clock.clone()
    }

    pub fn delay(&self) -> SimDelay {
        SimDelay::new(self.clock.clone())
    }

    pub fn memory(&self) -> SimMemory {
        self.memory.clone()
    }

    /// Backend for a pin handle; every pin shares the port
    pub fn gpio(&self) -> SimGpio {
        SimGpio::new(self.port.clone())
    }

    pub fn gpio_probe(&self) -> GpioProbe {
        GpioProbe::new(self.port.clone())
    }

    pub fn spi(&self) -> (SimSpi, SpiProbe) {
        SimSpi::new(self.description.fifo_depth, self.description.routes.clone())
    }

    pub fn i2s(&self) -> (SimI2s, I2sProbe) {
        SimI2s::new(self.description.i2s_fifo_depth, self.description.routes.clone())
    }

    pub fn sdio(&self) -> (SimSdio, SdioProbe) {
        SimSdio::new(self.description.routes.clone())
    }

    pub fn pdmpcm(&self) -> (SimPdmPcm, MicSignal) {
        SimPdmPcm::new(self.description.routes.clone())
    }

    pub fn adc(&self) -> (SimAdc, AnalogInputs) {
        SimAdc::new(self.description.routes.clone())
    }

    pub fn comp(&self) -> (SimComp, CompInputs) {
        SimComp::new(self.description.routes.clone())
    }

    pub fn timer(&self) -> (SimTimer, TimerProbe) {
        SimTimer::new(self.clock.clone())
    }

    pub fn rtc(&self) -> (SimRtc, RtcProbe) {
        SimRtc::new(self.clock.clone())
    }

    pub fn dma(&self) -> (SimDma, DmaProbe) {
        SimDma::new(self.memory.clone(), self.description.dma_map)
    }
}
