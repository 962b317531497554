//! Halcyon Hardware Abstraction Layer
//!
//! Peripheral ownership, configuration and interrupt-driven event delivery
//! for GPIO, SPI, I2S, SDIO, timers, the RTC, DMA and the audio/analog
//! front end. Drivers sit on top of
//! small backend traits that do the register work, so the same driver code
//! runs against silicon or against the simulated chip in `halcyon-hal-sim`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Application                            │
//! └─────────────────────────────────────────┘
//!                     │  init / configure / read / write / *_async
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │  halcyon-hal drivers                    │
//! │  Claim ── HwManager (exclusive owner)   │
//! │  EventCore + Transfers (callbacks)      │
//! └─────────────────────────────────────────┘
//!                     │  *Backend traits
//!         ┌───────────┴───────────┐
//!         ▼                       ▼
//! ┌───────────────┐       ┌───────────────┐
//! │  chip glue    │       │ halcyon-hal-  │
//! │  (registers)  │       │     sim       │
//! └───────────────┘       └───────────────┘
//! ```
//!
//! # Handles
//!
//! Every driver follows the same shape:
//!
//! - `init` claims the block and pins through a shared [`HwManager`]; a
//!   resource already owned fails with an `InUse` class error and nothing
//!   is left reserved.
//! - Operations take `&self` and fail with `NotInitialized` once the
//!   handle has been freed. `free` is also run on drop.
//! - `register_callback` and `enable_event` control what reaches the
//!   handler; `on_interrupt` is called from the peripheral's interrupt.
//! - Async transfers report exactly once: completed, failed or aborted.
//!
//! - [`gpio::Gpio`] - Digital pins with edge events
//! - [`spi::Spi`] - SPI master and slave
//! - [`i2s::I2s`] - Audio serial, blocking and async in both directions
//! - [`sdio::Sdio`] - SDIO device role with mailbox
//! - [`timer::Timer`] - Auxiliary down-counters
//! - [`rtc::Rtc`] - Calendar clock with DST and alarms
//! - [`dma::Dma`] - Controller channels routed by address
//! - [`pdmpcm::PdmPcm`] - Microphone capture to PCM, digital or analog
//! - [`adc::Adc`] - DC measurement on the analog front end
//! - [`comp::Comp`] - Low-power comparator channels

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

// Must come first so the logging macros are visible to every module
mod fmt;

pub mod adc;
pub mod blocking;
pub mod claim;
pub mod comp;
pub mod dma;
pub mod event;
pub mod gpio;
pub mod hwmgr;
pub mod i2s;
pub mod pdmpcm;
pub mod result;
pub mod rtc;
pub mod sdio;
pub mod spi;
pub mod timer;
pub mod transfer;

// Re-export the core types at crate root for convenience
pub use blocking::WAIT_FOREVER;
pub use claim::Claim;
pub use event::{EventHandler, Notification};
pub use hwmgr::{HwManager, Resource, ResourceLayout, ResourceType, TypeLayout};
pub use result::{Error, PeripheralKind, Result, ResultCode, StatusCode};
pub use transfer::{Direction, Serviced, TransferEvent, TransferFault, TransferState};
