//! Simulated audio serial block
//!
//! Samples only move when the probe clocks the bus: [`I2sProbe::shift`]
//! moves words from the transmit FIFO onto the line, [`I2sProbe::feed`]
//! puts words on the incoming line, which the receive FIFO takes while its
//! half is enabled.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use halcyon_hal::i2s::{AsyncMode, I2sBackend, I2sConfig, I2sError, I2sEvent, I2sPins};
use halcyon_hal::{Direction, Result, Serviced, TransferEvent, TransferFault};

use crate::lock;
use crate::routing::{PinFunction, PinMap};

#[derive(Debug, Default)]
struct I2sModel {
    depth: usize,
    block: Option<u8>,
    tx_pins: Option<I2sPins>,
    rx_pins: Option<I2sPins>,
    config: Option<I2sConfig>,
    tx_enabled: bool,
    rx_enabled: bool,
    tx_fifo: VecDeque<u32>,
    rx_fifo: VecDeque<u32>,
    line_out: Vec<u32>,
    line_in: VecDeque<u32>,
    mode: Option<AsyncMode>,
    irq: I2sEvent,
    write_run: Option<Vec<u32>>,
    read_run: Option<usize>,
    collected: Vec<u32>,
    fault_tx: Option<TransferFault>,
    fault_rx: Option<TransferFault>,
}

impl I2sModel {
    fn fill_rx(&mut self) {
        if !self.rx_enabled {
            return;
        }
        while self.rx_fifo.len() < self.depth {
            let Some(sample) = self.line_in.pop_front() else { break };
            self.rx_fifo.push_back(sample);
        }
    }
}

/// Backend for one I2S handle
#[derive(Debug, Clone)]
pub struct SimI2s {
    model: Arc<Mutex<I2sModel>>,
    routes: PinMap,
}

impl SimI2s {
    pub fn new(depth: usize, routes: PinMap) -> (Self, I2sProbe) {
        let model = Arc::new(Mutex::new(I2sModel {
            depth,
            ..I2sModel::default()
        }));
        (
            Self {
                model: model.clone(),
                routes,
            },
            I2sProbe { model },
        )
    }
}

impl I2sBackend for SimI2s {
    fn connect(
        &mut self,
        block: u8,
        tx: Option<&I2sPins>,
        rx: Option<&I2sPins>,
    ) -> Result<(), I2sError> {
        use PinFunction::*;

        let half = |pins: Option<&I2sPins>, [sck, ws, sd]: [PinFunction; 3]| {
            pins.map_or(true, |p| {
                self.routes.supports(p.sck, sck, block)
                    && self.routes.supports(p.ws, ws, block)
                    && self.routes.supports(p.data, sd, block)
                    && p.mclk.map_or(true, |mclk| self.routes.supports(mclk, TdmMclk, block))
            })
        };
        if !half(tx, [TdmTxSck, TdmTxWs, TdmTxSd]) || !half(rx, [TdmRxSck, TdmRxWs, TdmRxSd]) {
            return Err(I2sError::InvalidPin);
        }
        let mut m = lock(&self.model);
        m.block = Some(block);
        m.tx_pins = tx.copied();
        m.rx_pins = rx.copied();
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut m = lock(&self.model);
        m.block = None;
        m.tx_pins = None;
        m.rx_pins = None;
        m.tx_fifo.clear();
        m.rx_fifo.clear();
    }

    fn apply(&mut self, config: &I2sConfig) -> Result<(), I2sError> {
        config.validate()?;
        lock(&self.model).config = Some(*config);
        Ok(())
    }

    fn set_enabled(&mut self, direction: Direction, enabled: bool) {
        let mut m = lock(&self.model);
        match direction {
            Direction::Write => m.tx_enabled = enabled,
            Direction::Read => {
                m.rx_enabled = enabled;
                m.fill_rx();
            }
        }
    }

    fn clear(&mut self, direction: Direction) {
        let mut m = lock(&self.model);
        match direction {
            Direction::Write => m.tx_fifo.clear(),
            Direction::Read => m.rx_fifo.clear(),
        }
    }

    fn tx_free(&self) -> usize {
        let m = lock(&self.model);
        m.depth.saturating_sub(m.tx_fifo.len())
    }

    fn rx_available(&self) -> usize {
        lock(&self.model).rx_fifo.len()
    }

    fn push(&mut self, sample: u32) {
        let mut m = lock(&self.model);
        if m.tx_fifo.len() < m.depth {
            m.tx_fifo.push_back(sample);
        }
    }

    fn pop(&mut self) -> Option<u32> {
        let mut m = lock(&self.model);
        let sample = m.rx_fifo.pop_front();
        m.fill_rx();
        sample
    }

    fn tx_busy(&self) -> bool {
        !lock(&self.model).tx_fifo.is_empty()
    }

    fn set_async_mode(&mut self, mode: AsyncMode, _priority: u8) -> Result<(), I2sError> {
        lock(&self.model).mode = Some(mode);
        Ok(())
    }

    fn start_write(&mut self, samples: &[u32]) -> Result<(), I2sError> {
        let mut m = lock(&self.model);
        if m.write_run.is_some() {
            return Err(I2sError::Busy);
        }
        m.write_run = Some(samples.to_vec());
        Ok(())
    }

    fn start_read(&mut self, len: usize) -> Result<(), I2sError> {
        let mut m = lock(&self.model);
        if m.read_run.is_some() {
            return Err(I2sError::Busy);
        }
        m.read_run = Some(len);
        m.collected.clear();
        Ok(())
    }

    fn cancel(&mut self, direction: Direction) {
        let mut m = lock(&self.model);
        match direction {
            Direction::Write => m.write_run = None,
            Direction::Read => m.read_run = None,
        }
    }

    fn take_read(&mut self, buf: &mut [u32]) -> usize {
        let m = lock(&self.model);
        let n = buf.len().min(m.collected.len());
        buf[..n].copy_from_slice(&m.collected[..n]);
        n
    }

    fn set_interrupts(&mut self, events: I2sEvent, _priority: u8) {
        lock(&self.model).irq = events;
    }

    fn service_interrupt(&mut self) -> Serviced<I2sEvent> {
        let mut m = lock(&self.model);
        let mut serviced = Serviced::none();

        if m.write_run.is_some() && m.tx_enabled {
            serviced.write = Some(match m.fault_tx.take() {
                Some(kind) => {
                    m.write_run = None;
                    TransferEvent::Error { kind }
                }
                None => {
                    let samples = m.write_run.take().unwrap_or_default();
                    m.line_out.extend_from_slice(&samples);
                    TransferEvent::Complete {
                        bytes: samples.len() * 4,
                    }
                }
            });
        }

        if let Some(len) = m.read_run.filter(|_| m.rx_enabled) {
            if let Some(kind) = m.fault_rx.take() {
                m.read_run = None;
                serviced.read = Some(TransferEvent::Error { kind });
            } else {
                while m.collected.len() < len {
                    let sample = match m.rx_fifo.pop_front() {
                        Some(s) => s,
                        None => match m.line_in.pop_front() {
                            Some(s) => s,
                            None => break,
                        },
                    };
                    m.collected.push(sample);
                }
                if m.collected.len() == len {
                    m.read_run = None;
                    serviced.read = Some(TransferEvent::Complete { bytes: len * 4 });
                }
            }
        }

        let mut raised = I2sEvent::empty();
        if m.tx_fifo.is_empty() {
            raised |= I2sEvent::TX_EMPTY;
        }
        if !m.rx_fifo.is_empty() {
            raised |= I2sEvent::RX_NOT_EMPTY;
        }
        serviced.events = raised & m.irq;
        serviced
    }
}

/// Outside view of the audio lines
#[derive(Debug, Clone)]
pub struct I2sProbe {
    model: Arc<Mutex<I2sModel>>,
}

impl I2sProbe {
    /// Clock up to `n` samples out of the transmit FIFO
    ///
    /// Nothing moves while the transmit half is stopped. Returns the number
    /// of samples shifted.
    pub fn shift(&self, n: usize) -> usize {
        let mut m = lock(&self.model);
        if !m.tx_enabled {
            return 0;
        }
        let n = n.min(m.tx_fifo.len());
        let shifted: Vec<u32> = m.tx_fifo.drain(..n).collect();
        m.line_out.extend(shifted);
        n
    }

    /// Put samples on the incoming line
    pub fn feed(&self, samples: &[u32]) {
        let mut m = lock(&self.model);
        m.line_in.extend(samples);
        m.fill_rx();
    }

    /// Everything that made it onto the outgoing line
    pub fn drained(&self) -> Vec<u32> {
        lock(&self.model).line_out.clone()
    }

    /// Fail the next async transfer in `direction`
    pub fn fault(&self, direction: Direction, kind: TransferFault) {
        let mut m = lock(&self.model);
        match direction {
            Direction::Write => m.fault_tx = Some(kind),
            Direction::Read => m.fault_rx = Some(kind),
        }
    }

    pub fn is_enabled(&self, direction: Direction) -> bool {
        let m = lock(&self.model);
        match direction {
            Direction::Write => m.tx_enabled,
            Direction::Read => m.rx_enabled,
        }
    }

    pub fn config(&self) -> Option<I2sConfig> {
        lock(&self.model).config
    }

    pub fn async_mode(&self) -> Option<AsyncMode> {
        lock(&self.model).mode
    }
}
