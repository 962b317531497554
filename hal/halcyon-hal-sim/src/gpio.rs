//! Simulated GPIO port
//!
//! All pins live in one shared port model. The driver side gets a
//! [`SimGpio`] per pin handle; tests hold a [`GpioProbe`] to drive pads
//! from outside and look at what the driver programmed.

use std::sync::{Arc, Mutex};

use halcyon_hal::gpio::{DriveMode, Edge, GpioBackend, GpioConfig, GpioDirection, GpioError, GpioEvent};
use halcyon_hal::Result;

use crate::lock;

#[derive(Debug, Clone, Copy, Default)]
struct PinModel {
    config: Option<GpioConfig>,
    out: bool,
    /// Level forced onto the pad from outside
    external: Option<bool>,
    trigger: Option<Edge>,
    priority: u8,
    latched: GpioEvent,
}

impl PinModel {
    fn pad(&self) -> bool {
        match self.config {
            Some(c) if c.direction == GpioDirection::Output => match c.drive_mode {
                // An open-drain line only drives one level; the other floats
                DriveMode::OpenDrainDriveLow if self.out => self.external.unwrap_or(true),
                DriveMode::OpenDrainDriveHigh if !self.out => self.external.unwrap_or(false),
                _ => self.out,
            },
            Some(c) => self
                .external
                .unwrap_or(matches!(c.drive_mode, DriveMode::PullUp | DriveMode::PullUpDown)),
            None => self.external.unwrap_or(false),
        }
    }

    fn latch(&mut self, before: bool) {
        let after = self.pad();
        if before == after {
            return;
        }
        let edge = if after { GpioEvent::RISE } else { GpioEvent::FALL };
        let armed = match self.trigger {
            Some(Edge::Rising) => GpioEvent::RISE,
            Some(Edge::Falling) => GpioEvent::FALL,
            Some(Edge::Both) => GpioEvent::BOTH,
            None => GpioEvent::empty(),
        };
        self.latched |= edge & armed;
    }
}

#[derive(Debug)]
pub(crate) struct PortModel {
    pins: Vec<PinModel>,
}

impl PortModel {
    pub(crate) fn new(pins: usize) -> Self {
        Self {
            pins: vec![PinModel::default(); pins],
        }
    }
}

/// Backend for pin handles
#[derive(Debug, Clone)]
pub struct SimGpio {
    port: Arc<Mutex<PortModel>>,
}

impl SimGpio {
    pub(crate) fn new(port: Arc<Mutex<PortModel>>) -> Self {
        Self { port }
    }

    fn with_pin<R>(&self, pin: u8, f: impl FnOnce(&mut PinModel) -> R) -> Option<R> {
        let mut port = lock(&self.port);
        port.pins.get_mut(usize::from(pin)).map(f)
    }
}

impl GpioBackend for SimGpio {
    fn apply(&mut self, pin: u8, config: &GpioConfig) -> Result<(), GpioError> {
        if config.direction == GpioDirection::Bidirectional {
            return Err(GpioError::Unsupported);
        }
        self.with_pin(pin, |p| {
            let before = p.pad();
            p.config = Some(*config);
            if config.direction == GpioDirection::Output {
                p.out = config.init_value;
            }
            p.latch(before);
        })
        .ok_or(GpioError::InvalidPin)
    }

    fn disconnect(&mut self, pin: u8) {
        self.with_pin(pin, |p| {
            let external = p.external;
            *p = PinModel {
                external,
                ..PinModel::default()
            };
        });
    }

    fn write(&mut self, pin: u8, high: bool) {
        self.with_pin(pin, |p| {
            let before = p.pad();
            p.out = high;
            p.latch(before);
        });
    }

    fn read(&self, pin: u8) -> bool {
        self.with_pin(pin, |p| p.pad()).unwrap_or(false)
    }

    fn output_level(&self, pin: u8) -> bool {
        self.with_pin(pin, |p| p.out).unwrap_or(false)
    }

    fn set_trigger(&mut self, pin: u8, edge: Option<Edge>, priority: u8) {
        self.with_pin(pin, |p| {
            p.trigger = edge;
            p.priority = priority;
            if edge.is_none() {
                p.latched = GpioEvent::empty();
            }
        });
    }

    fn take_edges(&mut self, pin: u8) -> GpioEvent {
        self.with_pin(pin, |p| core::mem::take(&mut p.latched))
            .unwrap_or_default()
    }
}

/// Outside view of the port
#[derive(Debug, Clone)]
pub struct GpioProbe {
    port: Arc<Mutex<PortModel>>,
}

impl GpioProbe {
    pub(crate) fn new(port: Arc<Mutex<PortModel>>) -> Self {
        Self { port }
    }

    fn with_pin<R>(&self, pin: u8, f: impl FnOnce(&mut PinModel) -> R) -> R {
        let mut port = lock(&self.port);
        match port.pins.get_mut(usize::from(pin)) {
            Some(p) => f(p),
            None => panic!("pin {pin} is outside the simulated port"),
        }
    }

    /// Force a level onto the pad, latching an edge if one is armed
    pub fn drive(&self, pin: u8, level: bool) {
        self.with_pin(pin, |p| {
            let before = p.pad();
            p.external = Some(level);
            p.latch(before);
        });
    }

    /// Stop forcing the pad
    pub fn release(&self, pin: u8) {
        self.with_pin(pin, |p| {
            let before = p.pad();
            p.external = None;
            p.latch(before);
        });
    }

    pub fn level(&self, pin: u8) -> bool {
        self.with_pin(pin, |p| p.pad())
    }

    pub fn config(&self, pin: u8) -> Option<GpioConfig> {
        self.with_pin(pin, |p| p.config)
    }

    pub fn trigger(&self, pin: u8) -> Option<Edge> {
        self.with_pin(pin, |p| p.trigger)
    }

    /// Edges waiting for the interrupt handler
    pub fn pending_edges(&self, pin: u8) -> GpioEvent {
        self.with_pin(pin, |p| p.latched)
    }
}
