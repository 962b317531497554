//! Simulated Halcyon chip
//!
//! Host-side backends for every `halcyon-hal` driver, so drivers and the
//! code built on them can be exercised without hardware. Each backend
//! comes with a handle that plays the outside world: a peer on the bus, a
//! host on the SDIO link, a signal on a pin, a microphone or a voltage.
//! Pins are checked against the chip's routing table, so a pin the part
//! cannot mux to a signal fails init with an invalid-pin error.
//!
//! ```ignore
//! let chip = SimChip::reference();
//! let hw = chip.hw_manager()?;
//! let (backend, probe) = chip.spi();
//! let spi = Spi::init(&hw, backend, 0, pins, 8, Mode::Mode0, false)?;
//! ```
//!
//! Time only moves when something advances the chip's [`SimClock`],
//! usually a [`SimDelay`] handed to a blocking call.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod adc;
pub mod chip;
pub mod comp;
pub mod delay;
pub mod dma;
pub mod gpio;
pub mod i2s;
pub mod pdmpcm;
pub mod routing;
pub mod rtc;
pub mod sdio;
pub mod spi;
pub mod timer;

#[cfg(test)]
mod scenarios;

pub use adc::{AnalogInputs, SimAdc};
pub use chip::{ChipDescription, ChipError, SimChip};
pub use comp::{CompInputs, SimComp};
pub use delay::{SimClock, SimDelay};
pub use dma::{DmaProbe, SimDma, SimMemory};
pub use gpio::{GpioProbe, SimGpio};
pub use i2s::{I2sProbe, SimI2s};
pub use pdmpcm::{MicSignal, SimPdmPcm};
pub use routing::{PinFunction, PinMap, PinRoute};
pub use rtc::{RtcProbe, SimRtc};
pub use sdio::{SdioProbe, SimSdio};
pub use spi::{SimSpi, SpiProbe};
pub use timer::{SimTimer, TimerProbe};

/// A panicking test must not wedge every other probe on the model
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
