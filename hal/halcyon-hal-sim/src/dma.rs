//! Simulated DMA channel and system memory
//!
//! Memory-to-memory descriptors copy real bytes inside [`SimMemory`].
//! Peripheral endpoints are stand-ins: writes to a peripheral address are
//! recorded on the probe, reads from one are served from bytes queued on
//! the probe. A transfer runs on the first interrupt after it was started.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use halcyon_hal::dma::{DmaAddressMap, DmaBackend, DmaError, DmaEvent, DmaProgram, Endpoint};
use halcyon_hal::{Result, Serviced, TransferEvent, TransferFault};

use crate::lock;

/// Byte-addressed SRAM shared by every simulated bus master
#[derive(Debug, Clone)]
pub struct SimMemory {
    base: u32,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SimMemory {
    /// Zeroed memory covering `base..base + len`
    pub fn new(base: u32, len: usize) -> Self {
        Self {
            base,
            bytes: Arc::new(Mutex::new(vec![0; len])),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    fn offset(&self, addr: u32, len: usize) -> Option<usize> {
        let start = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        let size = lock(&self.bytes).len();
        (start + len <= size).then_some(start)
    }

    /// Copy `data` to `addr`; false if it does not fit
    pub fn write(&self, addr: u32, data: &[u8]) -> bool {
        let Some(start) = self.offset(addr, data.len()) else {
            return false;
        };
        lock(&self.bytes)[start..start + data.len()].copy_from_slice(data);
        true
    }

    /// `len` bytes from `addr`, or `None` outside memory
    pub fn read(&self, addr: u32, len: usize) -> Option<Vec<u8>> {
        let start = self.offset(addr, len)?;
        Some(lock(&self.bytes)[start..start + len].to_vec())
    }
}

#[derive(Debug, Default)]
struct ChannelModel {
    program: Option<DmaProgram>,
    enabled: bool,
    running: bool,
    irq: DmaEvent,
    /// Bytes written to peripheral addresses, with their address
    periph_out: Vec<(u32, Vec<u8>)>,
    periph_in: VecDeque<u8>,
    stalled: bool,
    fail_next: bool,
    completed: u32,
}

/// Backend for one DMA handle
#[derive(Debug, Clone)]
pub struct SimDma {
    memory: SimMemory,
    map: DmaAddressMap,
    model: Arc<Mutex<ChannelModel>>,
}

impl SimDma {
    pub fn new(memory: SimMemory, map: DmaAddressMap) -> (Self, DmaProbe) {
        let model = Arc::new(Mutex::new(ChannelModel::default()));
        (
            Self {
                memory,
                map,
                model: model.clone(),
            },
            DmaProbe { model },
        )
    }

    fn element(&self, m: &mut ChannelModel, addr: u32, width: usize) -> Option<Vec<u8>> {
        match self.map.classify(addr)? {
            Endpoint::Memory => self.memory.read(addr, width),
            Endpoint::Scb(_) | Endpoint::Tdm(_) => {
                // A peripheral that has nothing to give reads as zeros
                Some((0..width).map(|_| m.periph_in.pop_front().unwrap_or(0)).collect())
            }
        }
    }

    fn run(&self, m: &mut ChannelModel, program: &DmaProgram) -> TransferEvent {
        let config = &program.config;
        let width = usize::from(config.transfer_width / 8);
        for i in 0..config.length {
            let step = i * u32::from(config.transfer_width / 8);
            let src = config.src_addr + if config.src_increment { step } else { 0 };
            let dst = config.dst_addr + if config.dst_increment { step } else { 0 };

            let Some(data) = self.element(m, src, width) else {
                return TransferEvent::Error {
                    kind: TransferFault::Hardware,
                };
            };
            let stored = match self.map.classify(dst) {
                Some(Endpoint::Memory) => self.memory.write(dst, &data),
                Some(_) => {
                    m.periph_out.push((dst, data));
                    true
                }
                None => false,
            };
            if !stored {
                return TransferEvent::Error {
                    kind: TransferFault::Hardware,
                };
            }
        }
        TransferEvent::Complete {
            bytes: config.total_bytes(),
        }
    }
}

impl DmaBackend for SimDma {
    fn program(&mut self, program: &DmaProgram) -> Result<(), DmaError> {
        let mut m = lock(&self.model);
        if m.running {
            return Err(DmaError::Busy);
        }
        m.program = Some(*program);
        Ok(())
    }

    fn release(&mut self) {
        let mut m = lock(&self.model);
        m.program = None;
        m.running = false;
        m.enabled = false;
    }

    fn set_enabled(&mut self, enable: bool) {
        lock(&self.model).enabled = enable;
    }

    fn start(&mut self) -> Result<(), DmaError> {
        let mut m = lock(&self.model);
        if m.program.is_none() {
            return Err(DmaError::NotConfigured);
        }
        if !m.enabled {
            return Err(DmaError::ChannelDisabled);
        }
        if m.running {
            return Err(DmaError::Busy);
        }
        m.running = true;
        Ok(())
    }

    fn kill(&mut self) {
        lock(&self.model).running = false;
    }

    fn set_interrupts(&mut self, events: DmaEvent, _priority: u8) {
        lock(&self.model).irq = events;
    }

    fn service_interrupt(&mut self) -> Serviced<DmaEvent> {
        let mut guard = lock(&self.model);
        let m = &mut *guard;
        if !m.running || m.stalled {
            return Serviced::none();
        }
        m.running = false;
        let Some(program) = m.program else {
            return Serviced::none();
        };
        let outcome = if core::mem::take(&mut m.fail_next) {
            TransferEvent::Error {
                kind: TransferFault::Hardware,
            }
        } else {
            self.run(m, &program)
        };
        if matches!(outcome, TransferEvent::Complete { .. }) {
            m.completed += 1;
        }
        Serviced {
            write: Some(outcome),
            ..Serviced::none()
        }
    }
}

/// Outside view of the channel
#[derive(Debug, Clone)]
pub struct DmaProbe {
    model: Arc<Mutex<ChannelModel>>,
}

impl DmaProbe {
    pub fn program(&self) -> Option<DmaProgram> {
        lock(&self.model).program
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.model).enabled
    }

    pub fn is_running(&self) -> bool {
        lock(&self.model).running
    }

    /// Bytes a peripheral source hands out
    pub fn queue_periph_data(&self, bytes: &[u8]) {
        lock(&self.model).periph_in.extend(bytes);
    }

    /// Elements written to peripheral addresses, oldest first
    pub fn periph_writes(&self) -> Vec<(u32, Vec<u8>)> {
        lock(&self.model).periph_out.clone()
    }

    /// Hold transfers in flight until released
    pub fn stall(&self, stalled: bool) {
        lock(&self.model).stalled = stalled;
    }

    pub fn fail_next(&self) {
        lock(&self.model).fail_next = true;
    }

    /// Transfers that finished without error
    pub fn completed(&self) -> u32 {
        lock(&self.model).completed
    }
}
