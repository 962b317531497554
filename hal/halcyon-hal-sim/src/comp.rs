//! Simulated comparator channels
//!
//! A DC channel is high while its positive pin sits above its negative
//! pin; a noise-detect channel is high while [`CompInputs::set_noise`] says
//! so. The latch holds high from the moment the output is high until it is
//! cleared, and clearing it while the output is still high keeps it set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use halcyon_hal::comp::{CompBackend, CompConfig, CompError, CompMode, CompRoute};

use crate::lock;
use crate::routing::{PinFunction, PinMap};

const CHANNELS: usize = 2;

#[derive(Debug, Default, Clone, Copy)]
struct ChannelModel {
    pins: Option<(u8, Option<u8>)>,
    mode: Option<CompMode>,
    config: Option<CompConfig>,
    output: bool,
    latched: bool,
    irq: bool,
    pending: bool,
}

#[derive(Debug, Default)]
struct CompModel {
    levels: HashMap<u8, i32>,
    noise: bool,
    /// Pins of the last routed pair, taken by `connect`
    staged: Option<(u8, Option<u8>)>,
    channels: [ChannelModel; CHANNELS],
}

impl CompModel {
    fn output_of(&self, ch: &ChannelModel) -> bool {
        match (ch.mode, ch.pins) {
            (Some(CompMode::NoiseDetect), _) => self.noise,
            (Some(CompMode::Dc), Some((p, m))) => {
                let level = |pin: Option<u8>| pin.and_then(|pin| self.levels.get(&pin)).copied().unwrap_or(0);
                level(Some(p)) > level(m)
            }
            _ => false,
        }
    }

    /// Re-evaluate every connected channel after an input changed
    fn update(&mut self) {
        for i in 0..CHANNELS {
            let ch = self.channels[i];
            let output = self.output_of(&ch);
            let ch = &mut self.channels[i];
            if output && !ch.output {
                ch.latched = true;
                if ch.irq {
                    ch.pending = true;
                }
            }
            ch.output = output;
        }
    }
}

/// Backend for comparator handles; both channels share one model
#[derive(Debug, Clone)]
pub struct SimComp {
    model: Arc<Mutex<CompModel>>,
    routes: PinMap,
}

impl SimComp {
    pub fn new(routes: PinMap) -> (Self, CompInputs) {
        let model = Arc::new(Mutex::new(CompModel::default()));
        (
            Self {
                model: model.clone(),
                routes,
            },
            CompInputs { model },
        )
    }

    fn channel(channel: u8) -> usize {
        usize::from(channel).min(CHANNELS - 1)
    }
}

impl CompBackend for SimComp {
    fn route(&mut self, vin_p: u8, vin_m: Option<u8>) -> Result<CompRoute, CompError> {
        let positive = self
            .routes
            .find(vin_p, PinFunction::CompInP)
            .ok_or(CompError::InvalidPin)?;
        let Some(vin_m) = vin_m else {
            // Without a negative pin only the microphone input works, as a
            // noise detector
            if self.routes.find(vin_p, PinFunction::MicP).is_none() {
                return Err(CompError::InvalidPin);
            }
            lock(&self.model).staged = Some((vin_p, None));
            return Ok(CompRoute {
                channel: positive.channel,
                mode: CompMode::NoiseDetect,
            });
        };
        let negative = self
            .routes
            .find_on(vin_m, PinFunction::CompInN, positive.block)
            .filter(|r| r.channel == positive.channel)
            .ok_or(CompError::InvalidPin)?;
        if usize::from(negative.channel) >= CHANNELS {
            return Err(CompError::InvalidPin);
        }
        lock(&self.model).staged = Some((vin_p, Some(vin_m)));
        Ok(CompRoute {
            channel: negative.channel,
            mode: CompMode::Dc,
        })
    }

    fn connect(&mut self, route: CompRoute) {
        let mut m = lock(&self.model);
        let pins = m.staged.take();
        let i = Self::channel(route.channel);
        m.channels[i].pins = pins;
        m.channels[i].mode = Some(route.mode);
        let output = m.output_of(&m.channels[i]);
        m.channels[i].output = output;
    }

    fn disconnect(&mut self, channel: u8) {
        lock(&self.model).channels[Self::channel(channel)] = ChannelModel::default();
    }

    fn apply(&mut self, channel: u8, config: &CompConfig) {
        lock(&self.model).channels[Self::channel(channel)].config = Some(*config);
    }

    fn latched_high(&self, channel: u8) -> bool {
        lock(&self.model).channels[Self::channel(channel)].latched
    }

    fn clear_latch(&mut self, channel: u8) {
        let mut m = lock(&self.model);
        let ch = &mut m.channels[Self::channel(channel)];
        ch.latched = ch.output;
    }

    fn set_interrupt(&mut self, channel: u8, enable: bool) {
        let mut m = lock(&self.model);
        let ch = &mut m.channels[Self::channel(channel)];
        ch.irq = enable;
        if !enable {
            ch.pending = false;
        }
    }

    fn service_interrupt(&mut self, channel: u8) -> bool {
        core::mem::take(&mut lock(&self.model).channels[Self::channel(channel)].pending)
    }
}

/// Levels on the comparator pins
#[derive(Debug, Clone)]
pub struct CompInputs {
    model: Arc<Mutex<CompModel>>,
}

impl CompInputs {
    /// Put `uv` microvolts on `pin`
    pub fn set_uv(&self, pin: u8, uv: i32) {
        let mut m = lock(&self.model);
        m.levels.insert(pin, uv);
        m.update();
    }

    /// Microphone noise above the detector threshold
    pub fn set_noise(&self, noisy: bool) {
        let mut m = lock(&self.model);
        m.noise = noisy;
        m.update();
    }

    pub fn output(&self, channel: u8) -> bool {
        lock(&self.model).channels[SimComp::channel(channel)].output
    }

    pub fn mode(&self, channel: u8) -> Option<CompMode> {
        lock(&self.model).channels[SimComp::channel(channel)].mode
    }

    pub fn config(&self, channel: u8) -> Option<CompConfig> {
        lock(&self.model).channels[SimComp::channel(channel)].config
    }

    pub fn interrupt_enabled(&self, channel: u8) -> bool {
        lock(&self.model).channels[SimComp::channel(channel)].irq
    }
}
