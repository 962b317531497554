//! Simulated SDIO device core with a scripted host
//!
//! The probe plays the host: it enables the I/O function, pushes frames
//! for the device to read, collects frames the device offered, and talks
//! through the mailbox.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use halcyon_hal::sdio::{SdioBackend, SdioConfig, SdioError, SdioEvent, SdioPins};
use halcyon_hal::{Direction, Result, Serviced, TransferEvent, TransferFault};

use crate::lock;
use crate::routing::{PinFunction, PinMap};

#[derive(Debug, Default)]
struct SdioModel {
    pins: Option<SdioPins>,
    config: Option<SdioConfig>,
    host_io: bool,
    io_ready: bool,
    irq: bool,
    /// Mailbox words from the host, newest last
    mailbox_in: VecDeque<u32>,
    /// Signals the device sent, oldest first
    mailbox_out: Vec<(u32, Option<u32>)>,
    host_info: bool,
    to_device: VecDeque<Vec<u8>>,
    to_host: VecDeque<Vec<u8>>,
    read_run: Option<usize>,
    write_run: Option<Vec<u8>>,
    last_read: Vec<u8>,
    stalled: bool,
    fail_read: bool,
    fail_write: bool,
}

/// Backend for the SDIO handle
#[derive(Debug, Clone)]
pub struct SimSdio {
    model: Arc<Mutex<SdioModel>>,
    routes: PinMap,
}

impl SimSdio {
    pub fn new(routes: PinMap) -> (Self, SdioProbe) {
        let model = Arc::new(Mutex::new(SdioModel::default()));
        (
            Self {
                model: model.clone(),
                routes,
            },
            SdioProbe { model },
        )
    }
}

impl SdioBackend for SimSdio {
    fn connect(&mut self, pins: &SdioPins) -> Result<(), SdioError> {
        let routed = self.routes.supports(pins.cmd, PinFunction::SdioCmd, 0)
            && self.routes.supports(pins.clk, PinFunction::SdioClk, 0)
            && pins
                .data
                .iter()
                .all(|&pin| self.routes.supports(pin, PinFunction::SdioData, 0));
        if !routed {
            return Err(SdioError::InvalidPin);
        }
        lock(&self.model).pins = Some(*pins);
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut m = lock(&self.model);
        m.pins = None;
        m.config = None;
        m.io_ready = false;
    }

    fn apply(&mut self, config: &SdioConfig) -> Result<(), SdioError> {
        config.validate()?;
        lock(&self.model).config = Some(*config);
        Ok(())
    }

    fn host_io_enabled(&self) -> bool {
        lock(&self.model).host_io
    }

    fn set_io_ready(&mut self) -> Result<(), SdioError> {
        let mut m = lock(&self.model);
        if m.config.is_none() {
            return Err(SdioError::NotReady);
        }
        m.io_ready = true;
        Ok(())
    }

    fn mailbox_write(&mut self, bits: u32, data: Option<u32>) -> Result<(), SdioError> {
        let mut m = lock(&self.model);
        if !m.host_io {
            return Err(SdioError::MailboxWrite);
        }
        m.mailbox_out.push((bits, data));
        Ok(())
    }

    fn mailbox_read(&mut self) -> Result<u32, SdioError> {
        lock(&self.model)
            .mailbox_in
            .pop_front()
            .ok_or(SdioError::MailboxRead)
    }

    fn start_read(&mut self, len: usize) -> Result<(), SdioError> {
        let mut m = lock(&self.model);
        if m.read_run.is_some() {
            return Err(SdioError::Busy);
        }
        m.read_run = Some(len);
        Ok(())
    }

    fn start_write(&mut self, data: &[u8]) -> Result<(), SdioError> {
        let mut m = lock(&self.model);
        if m.write_run.is_some() {
            return Err(SdioError::Busy);
        }
        m.write_run = Some(data.to_vec());
        Ok(())
    }

    fn cancel(&mut self, direction: Direction) {
        let mut m = lock(&self.model);
        match direction {
            Direction::Read => m.read_run = None,
            Direction::Write => m.write_run = None,
        }
    }

    fn take_read(&mut self, buf: &mut [u8]) -> usize {
        let m = lock(&self.model);
        let n = buf.len().min(m.last_read.len());
        buf[..n].copy_from_slice(&m.last_read[..n]);
        n
    }

    fn set_interrupts(&mut self, enabled: bool) {
        lock(&self.model).irq = enabled;
    }

    fn service_interrupt(&mut self) -> Serviced<SdioEvent> {
        let mut m = lock(&self.model);
        let mut serviced = Serviced::none();
        if core::mem::take(&mut m.host_info) {
            serviced.events |= SdioEvent::HOST_INFO;
        }
        if m.stalled {
            return serviced;
        }

        if let Some(len) = m.read_run {
            if core::mem::take(&mut m.fail_read) {
                m.read_run = None;
                serviced.read = Some(TransferEvent::Error {
                    kind: TransferFault::Hardware,
                });
            } else if let Some(frame) = m.to_device.pop_front() {
                m.read_run = None;
                serviced.read = Some(if frame.len() > len {
                    TransferEvent::Error {
                        kind: TransferFault::Overflow,
                    }
                } else {
                    let bytes = frame.len();
                    m.last_read = frame;
                    TransferEvent::Complete { bytes }
                });
            }
        }

        if let Some(frame) = m.write_run.take() {
            if core::mem::take(&mut m.fail_write) {
                serviced.write = Some(TransferEvent::Error {
                    kind: TransferFault::Hardware,
                });
            } else {
                serviced.write = Some(TransferEvent::Complete { bytes: frame.len() });
                m.to_host.push_back(frame);
            }
        }
        serviced
    }
}

/// The host side of the bus
#[derive(Debug, Clone)]
pub struct SdioProbe {
    model: Arc<Mutex<SdioModel>>,
}

impl SdioProbe {
    pub fn enable_host_io(&self, enabled: bool) {
        lock(&self.model).host_io = enabled;
    }

    /// Device told the host it is ready
    pub fn io_ready(&self) -> bool {
        lock(&self.model).io_ready
    }

    /// Queue a frame for the device to read
    pub fn host_send(&self, frame: &[u8]) {
        lock(&self.model).to_device.push_back(frame.to_vec());
    }

    /// Oldest frame the device offered
    pub fn host_take(&self) -> Option<Vec<u8>> {
        lock(&self.model).to_host.pop_front()
    }

    /// Write the mailbox, latching a host-info interrupt
    pub fn host_mailbox_write(&self, word: u32) {
        let mut m = lock(&self.model);
        m.mailbox_in.push_back(word);
        m.host_info = true;
    }

    /// Signals the device sent so far
    pub fn mailbox_out(&self) -> Vec<(u32, Option<u32>)> {
        lock(&self.model).mailbox_out.clone()
    }

    /// Hold transfers in flight until released
    pub fn stall(&self, stalled: bool) {
        lock(&self.model).stalled = stalled;
    }

    /// Fail the next transfer in `direction`
    pub fn fail_next(&self, direction: Direction) {
        let mut m = lock(&self.model);
        match direction {
            Direction::Read => m.fail_read = true,
            Direction::Write => m.fail_write = true,
        }
    }

    pub fn config(&self) -> Option<SdioConfig> {
        lock(&self.model).config
    }

    pub fn interrupts_enabled(&self) -> bool {
        lock(&self.model).irq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_needs_host_io() {
        let (mut sdio, probe) = SimSdio::new(PinMap::reference());
        assert_eq!(sdio.mailbox_write(1, None), Err(SdioError::MailboxWrite));
        assert_eq!(sdio.mailbox_read(), Err(SdioError::MailboxRead));

        probe.enable_host_io(true);
        sdio.mailbox_write(0x4, Some(0xCAFE)).unwrap();
        assert_eq!(probe.mailbox_out(), vec![(0x4, Some(0xCAFE))]);

        probe.host_mailbox_write(0x55);
        assert_eq!(sdio.service_interrupt().events, SdioEvent::HOST_INFO);
        assert_eq!(sdio.mailbox_read(), Ok(0x55));
    }

    #[test]
    fn test_read_waits_for_host_frame() {
        let (mut sdio, probe) = SimSdio::new(PinMap::reference());
        sdio.start_read(16).unwrap();
        assert!(sdio.service_interrupt().read.is_none());

        probe.host_send(b"ping");
        assert_eq!(
            sdio.service_interrupt().read,
            Some(TransferEvent::Complete { bytes: 4 })
        );
        let mut buf = [0; 16];
        assert_eq!(sdio.take_read(&mut buf), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn test_oversized_frame_overflows() {
        let (mut sdio, probe) = SimSdio::new(PinMap::reference());
        sdio.start_read(2).unwrap();
        probe.host_send(b"toolong");
        assert_eq!(
            sdio.service_interrupt().read,
            Some(TransferEvent::Error {
                kind: TransferFault::Overflow
            })
        );
    }

    #[test]
    fn test_write_reaches_host() {
        let (mut sdio, probe) = SimSdio::new(PinMap::reference());
        sdio.start_write(b"pong").unwrap();
        assert_eq!(sdio.start_write(b"x"), Err(SdioError::Busy));
        assert_eq!(
            sdio.service_interrupt().write,
            Some(TransferEvent::Complete { bytes: 4 })
        );
        assert_eq!(probe.host_take().as_deref(), Some(&b"pong"[..]));
    }
}
