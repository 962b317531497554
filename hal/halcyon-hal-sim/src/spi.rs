//! Simulated SPI block
//!
//! In master mode every pushed frame is exchanged at once with whatever
//! sits on the other end of the bus: the frame itself when the bus is
//! looped back, otherwise the next frame queued on the probe. In slave mode
//! frames wait in the transmit FIFO until the probe plays master.
//!
//! Async transfers run to completion on the next interrupt unless the
//! probe stalls them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use halcyon_hal::spi::{SpiBackend, SpiConfig, SpiError, SpiEvent, SpiPins, SselPolarity};
use halcyon_hal::{Result, Serviced, TransferEvent, TransferFault};

use crate::lock;
use crate::routing::{PinFunction, PinMap};

#[derive(Debug)]
struct AsyncRun {
    tx: Vec<u8>,
    rx_len: usize,
}

#[derive(Debug, Default)]
struct SpiModel {
    depth: usize,
    block: Option<u8>,
    pins: Option<SpiPins>,
    config: Option<SpiConfig>,
    loopback: bool,
    tx: VecDeque<u32>,
    rx: VecDeque<u32>,
    /// Frames the far end answers with
    peer: VecDeque<u32>,
    peer_bytes: VecDeque<u8>,
    /// Everything that went out on MOSI
    wire: Vec<u32>,
    wire_bytes: Vec<u8>,
    ssels: Vec<(u8, SselPolarity)>,
    selected: Option<(u8, SselPolarity)>,
    fifo_level: u8,
    irq: SpiEvent,
    run: Option<AsyncRun>,
    received: Vec<u8>,
    stalled: bool,
    fail_next: bool,
    overflowed: u32,
}

impl SpiModel {
    fn mask(&self) -> u32 {
        self.config.map_or(u32::MAX, |c| c.frame_mask())
    }

    fn is_slave(&self) -> bool {
        self.config.is_some_and(|c| c.is_slave)
    }
}

/// Backend for one SPI handle
#[derive(Debug, Clone)]
pub struct SimSpi {
    model: Arc<Mutex<SpiModel>>,
    routes: PinMap,
}

impl SimSpi {
    /// Block with `depth`-frame FIFOs wired per `routes`, plus its probe
    pub fn new(depth: usize, routes: PinMap) -> (Self, SpiProbe) {
        let model = Arc::new(Mutex::new(SpiModel {
            depth,
            loopback: true,
            ..SpiModel::default()
        }));
        (
            Self {
                model: model.clone(),
                routes,
            },
            SpiProbe { model },
        )
    }
}

impl SpiBackend for SimSpi {
    fn connect(&mut self, block: u8, pins: &SpiPins) -> Result<(), SpiError> {
        let optional = |pin: Option<u8>, function| {
            pin.map_or(true, |pin| self.routes.supports(pin, function, block))
        };
        let routed = self.routes.supports(pins.sclk, PinFunction::SpiClk, block)
            && optional(pins.mosi, PinFunction::SpiMosi)
            && optional(pins.miso, PinFunction::SpiMiso)
            && optional(pins.ssel, PinFunction::SpiSsel);
        if !routed {
            return Err(SpiError::InvalidPin);
        }
        let mut m = lock(&self.model);
        m.block = Some(block);
        m.pins = Some(*pins);
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut m = lock(&self.model);
        m.block = None;
        m.pins = None;
        m.config = None;
        m.selected = None;
        m.tx.clear();
        m.rx.clear();
    }

    fn apply(&mut self, config: &SpiConfig) -> Result<(), SpiError> {
        config.validate()?;
        lock(&self.model).config = Some(*config);
        Ok(())
    }

    fn connect_ssel(&mut self, pin: u8, polarity: SselPolarity) -> Result<(), SpiError> {
        let mut m = lock(&self.model);
        let block = m.block.unwrap_or(0);
        if !self.routes.supports(pin, PinFunction::SpiSsel, block) {
            return Err(SpiError::InvalidPin);
        }
        if m.ssels.iter().any(|&(p, _)| p == pin) {
            return Err(SpiError::InUse);
        }
        m.ssels.push((pin, polarity));
        Ok(())
    }

    fn disconnect_ssel(&mut self, pin: u8) {
        let mut m = lock(&self.model);
        m.ssels.retain(|&(p, _)| p != pin);
        if m.selected.is_some_and(|(p, _)| p == pin) {
            m.selected = None;
        }
    }

    fn select(&mut self, pin: u8, polarity: SselPolarity) {
        lock(&self.model).selected = Some((pin, polarity));
    }

    fn tx_free(&self) -> usize {
        let m = lock(&self.model);
        if m.is_slave() {
            m.depth.saturating_sub(m.tx.len())
        } else {
            // Exchanges are immediate, so receive room is the limit
            m.depth.saturating_sub(m.rx.len())
        }
    }

    fn rx_available(&self) -> usize {
        lock(&self.model).rx.len()
    }

    fn push(&mut self, frame: u32) {
        let mut m = lock(&self.model);
        if m.is_slave() {
            if m.tx.len() < m.depth {
                m.tx.push_back(frame);
            }
            return;
        }
        m.wire.push(frame);
        let answer = if m.loopback {
            frame
        } else {
            let fill = m.mask();
            m.peer.pop_front().unwrap_or(fill)
        };
        if m.rx.len() < m.depth {
            m.rx.push_back(answer);
        } else {
            m.overflowed += 1;
        }
    }

    fn pop(&mut self) -> Option<u32> {
        lock(&self.model).rx.pop_front()
    }

    fn clear_fifos(&mut self) {
        let mut m = lock(&self.model);
        m.tx.clear();
        m.rx.clear();
    }

    fn set_fifo_level(&mut self, level: u8) -> Result<(), SpiError> {
        let mut m = lock(&self.model);
        if usize::from(level) > m.depth {
            return Err(SpiError::InvalidArgument);
        }
        m.fifo_level = level;
        Ok(())
    }

    fn set_interrupts(&mut self, events: SpiEvent, _priority: u8) {
        lock(&self.model).irq = events;
    }

    fn start_async(&mut self, tx: &[u8], rx_len: usize, fill: u8) -> Result<(), SpiError> {
        let mut m = lock(&self.model);
        if m.run.is_some() {
            return Err(SpiError::Busy);
        }
        let mut bytes = tx.to_vec();
        bytes.resize(tx.len().max(rx_len), fill);
        m.run = Some(AsyncRun { tx: bytes, rx_len });
        Ok(())
    }

    fn cancel_async(&mut self) {
        lock(&self.model).run = None;
    }

    fn take_received(&mut self, buf: &mut [u8]) -> usize {
        let m = lock(&self.model);
        let n = buf.len().min(m.received.len());
        buf[..n].copy_from_slice(&m.received[..n]);
        n
    }

    fn service_interrupt(&mut self) -> Serviced<SpiEvent> {
        let mut m = lock(&self.model);
        let mut serviced = Serviced::none();

        if !m.stalled {
            if let Some(run) = m.run.take() {
                if core::mem::take(&mut m.fail_next) {
                    serviced.write = Some(TransferEvent::Error {
                        kind: TransferFault::Hardware,
                    });
                } else {
                    let mut received = Vec::with_capacity(run.tx.len());
                    for &b in &run.tx {
                        let answer = if m.loopback {
                            b
                        } else {
                            m.peer_bytes.pop_front().unwrap_or(0xFF)
                        };
                        received.push(answer);
                    }
                    received.truncate(run.rx_len);
                    m.wire_bytes.extend_from_slice(&run.tx);
                    m.received = received;
                    serviced.write = Some(TransferEvent::Complete {
                        bytes: run.tx.len(),
                    });
                }
            }
        }

        if m.fifo_level > 0 && m.rx.len() >= usize::from(m.fifo_level) {
            serviced.events |= SpiEvent::DATA_IN_FIFO & m.irq;
        }
        serviced
    }
}

/// Outside view of the bus
#[derive(Debug, Clone)]
pub struct SpiProbe {
    model: Arc<Mutex<SpiModel>>,
}

impl SpiProbe {
    /// Answer with the frames sent (default) or with queued peer data
    pub fn set_loopback(&self, loopback: bool) {
        lock(&self.model).loopback = loopback;
    }

    /// Frames the far end sends back in master mode
    pub fn queue_peer(&self, frames: &[u32]) {
        lock(&self.model).peer.extend(frames);
    }

    /// Bytes the far end sends back during async transfers
    pub fn queue_peer_bytes(&self, bytes: &[u8]) {
        lock(&self.model).peer_bytes.extend(bytes);
    }

    /// Frames clocked out so far, oldest first
    pub fn wire(&self) -> Vec<u32> {
        lock(&self.model).wire.clone()
    }

    /// Bytes clocked out by async transfers
    pub fn wire_bytes(&self) -> Vec<u8> {
        lock(&self.model).wire_bytes.clone()
    }

    /// Play master against a slave-mode block
    ///
    /// Each frame lands in the receive FIFO; the answers come from the
    /// transmit FIFO, all ones once it runs dry.
    pub fn master_exchange(&self, frames: &[u32]) -> Vec<u32> {
        let mut m = lock(&self.model);
        let fill = m.mask();
        frames
            .iter()
            .map(|&frame| {
                if m.rx.len() < m.depth {
                    m.rx.push_back(frame);
                } else {
                    m.overflowed += 1;
                }
                m.tx.pop_front().unwrap_or(fill)
            })
            .collect()
    }

    /// Hold async transfers in flight until released
    pub fn stall(&self, stalled: bool) {
        lock(&self.model).stalled = stalled;
    }

    /// Fail the next async transfer
    pub fn fail_next(&self) {
        lock(&self.model).fail_next = true;
    }

    pub fn is_running(&self) -> bool {
        lock(&self.model).run.is_some()
    }

    pub fn config(&self) -> Option<SpiConfig> {
        lock(&self.model).config
    }

    pub fn block(&self) -> Option<u8> {
        lock(&self.model).block
    }

    pub fn selected(&self) -> Option<(u8, SselPolarity)> {
        lock(&self.model).selected
    }

    pub fn slave_selects(&self) -> Vec<(u8, SselPolarity)> {
        lock(&self.model).ssels.clone()
    }

    /// Frames dropped because the receive FIFO was full
    pub fn overflowed(&self) -> u32 {
        lock(&self.model).overflowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master() -> (SimSpi, SpiProbe) {
        let (mut spi, probe) = SimSpi::new(4, PinMap::reference());
        spi.apply(&SpiConfig::default()).unwrap();
        (spi, probe)
    }

    #[test]
    fn test_master_exchange_with_peer() {
        let (mut spi, probe) = master();
        probe.set_loopback(false);
        probe.queue_peer(&[0x11]);
        spi.push(0xA0);
        spi.push(0xA1);
        assert_eq!(spi.pop(), Some(0x11));
        assert_eq!(spi.pop(), Some(0xFF));
        assert_eq!(probe.wire(), vec![0xA0, 0xA1]);
    }

    #[test]
    fn test_receive_room_limits_master() {
        let (mut spi, probe) = master();
        for n in 0..5 {
            spi.push(n);
        }
        assert_eq!(spi.tx_free(), 0);
        assert_eq!(probe.overflowed(), 1);
    }

    #[test]
    fn test_async_pads_and_truncates() {
        let (mut spi, probe) = master();
        spi.start_async(&[1, 2], 4, 0xEE).unwrap();
        assert_eq!(spi.start_async(&[3], 1, 0), Err(SpiError::Busy));

        let serviced = spi.service_interrupt();
        assert_eq!(serviced.write, Some(TransferEvent::Complete { bytes: 4 }));
        assert_eq!(probe.wire_bytes(), vec![1, 2, 0xEE, 0xEE]);
        let mut buf = [0u8; 8];
        assert_eq!(spi.take_received(&mut buf), 4);
        assert_eq!(&buf[..4], &[1, 2, 0xEE, 0xEE]);
    }

    #[test]
    fn test_stalled_transfer_stays_running() {
        let (mut spi, probe) = master();
        probe.stall(true);
        spi.start_async(&[1], 1, 0).unwrap();
        assert!(spi.service_interrupt().write.is_none());
        assert!(probe.is_running());
        probe.stall(false);
        assert!(spi.service_interrupt().write.is_some());
    }

    #[test]
    fn test_fifo_level_event() {
        let (mut spi, _) = master();
        spi.set_fifo_level(2).unwrap();
        spi.set_interrupts(SpiEvent::DATA_IN_FIFO, 0);
        spi.push(1);
        assert!(spi.service_interrupt().events.is_empty());
        spi.push(2);
        assert_eq!(spi.service_interrupt().events, SpiEvent::DATA_IN_FIFO);
        assert_eq!(spi.set_fifo_level(9), Err(SpiError::InvalidArgument));
    }
}
