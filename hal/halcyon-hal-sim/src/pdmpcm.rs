//! Simulated PDM/PCM converter
//!
//! The microphone is a queue of FIFO halves. While the converter runs,
//! each call to the backend's `half_ready` moves the next queued half into
//! the FIFO, replacing whatever half was there. An analog microphone also
//! needs its front end marked ready before the converter will start.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use halcyon_hal::pdmpcm::{PdmInput, PdmPcmBackend, PdmPcmConfig, PdmPcmError, PdmPcmEvent, READ_LEN};
use halcyon_hal::Result;

use crate::lock;
use crate::routing::{PinFunction, PinMap};

#[derive(Debug, Default)]
struct PdmModel {
    input: Option<PdmInput>,
    config: Option<PdmPcmConfig>,
    enabled: bool,
    front_end_ready: bool,
    halves: VecDeque<Vec<i16>>,
    fifo: Option<Vec<i16>>,
    irq: PdmPcmEvent,
}

/// Backend for the converter handle
#[derive(Debug, Clone)]
pub struct SimPdmPcm {
    model: Arc<Mutex<PdmModel>>,
    routes: PinMap,
}

impl SimPdmPcm {
    pub fn new(routes: PinMap) -> (Self, MicSignal) {
        let model = Arc::new(Mutex::new(PdmModel::default()));
        (
            Self {
                model: model.clone(),
                routes,
            },
            MicSignal { model },
        )
    }
}

impl PdmPcmBackend for SimPdmPcm {
    fn connect(&mut self, input: &PdmInput) -> Result<(), PdmPcmError> {
        let routed = match *input {
            PdmInput::Digital { clk, data } => {
                self.routes.supports(clk, PinFunction::PdmClk, 0)
                    && self.routes.supports(data, PinFunction::PdmData, 0)
            }
            PdmInput::Analog { mic } => self.routes.supports(mic, PinFunction::MicP, 0),
        };
        if !routed {
            return Err(PdmPcmError::InvalidPin);
        }
        let mut m = lock(&self.model);
        m.input = Some(*input);
        // A digital microphone needs no front end
        if let PdmInput::Digital { .. } = input {
            m.front_end_ready = true;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut m = lock(&self.model);
        m.input = None;
        m.config = None;
        m.enabled = false;
        m.fifo = None;
    }

    fn apply(&mut self, config: &PdmPcmConfig) -> Result<(), PdmPcmError> {
        config.validate()?;
        lock(&self.model).config = Some(*config);
        Ok(())
    }

    fn front_end_ready(&mut self) -> bool {
        lock(&self.model).front_end_ready
    }

    fn set_enabled(&mut self, enabled: bool) {
        lock(&self.model).enabled = enabled;
    }

    fn clear(&mut self) {
        lock(&self.model).fifo = None;
    }

    fn half_ready(&mut self) -> bool {
        let mut m = lock(&self.model);
        if !m.enabled {
            return false;
        }
        match m.halves.pop_front() {
            Some(half) => {
                m.fifo = Some(half);
                true
            }
            None => false,
        }
    }

    fn read_half(&mut self, buf: &mut [i16]) -> usize {
        let Some(half) = lock(&self.model).fifo.take() else { return 0 };
        let n = buf.len().min(half.len());
        buf[..n].copy_from_slice(&half[..n]);
        n
    }

    fn set_interrupts(&mut self, events: PdmPcmEvent, _priority: u8) {
        lock(&self.model).irq = events;
    }
}

/// The microphone side of the simulated converter
#[derive(Debug, Clone)]
pub struct MicSignal {
    model: Arc<Mutex<PdmModel>>,
}

impl MicSignal {
    /// Queue one FIFO half; short halves are padded with silence
    pub fn feed_half(&self, samples: &[i16]) {
        let mut half = samples.to_vec();
        half.resize(READ_LEN, 0);
        lock(&self.model).halves.push_back(half);
    }

    /// Queue `count` halves holding `level`
    pub fn feed_tone(&self, level: i16, count: usize) {
        for _ in 0..count {
            self.feed_half(&[level; READ_LEN]);
        }
    }

    /// Analog front end finished powering up and the noise detector is quiet
    pub fn set_front_end_ready(&self, ready: bool) {
        lock(&self.model).front_end_ready = ready;
    }

    /// Halves still waiting on the microphone
    pub fn queued(&self) -> usize {
        lock(&self.model).halves.len()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.model).enabled
    }

    pub fn input(&self) -> Option<PdmInput> {
        lock(&self.model).input
    }

    pub fn config(&self) -> Option<PdmPcmConfig> {
        lock(&self.model).config
    }

    pub fn interrupts(&self) -> PdmPcmEvent {
        lock(&self.model).irq
    }
}
