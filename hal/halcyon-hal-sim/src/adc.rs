//! Simulated ADC front end
//!
//! Each routed input reads whatever level [`AnalogInputs`] set on its pin.
//! DC offset calibration finishes on the first interrupt after power-up;
//! from then on a started conversion is done at once and is reported by
//! the next interrupt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use halcyon_hal::adc::{AdcBackend, AdcError, COUNTS_PER_VOLT};
use halcyon_hal::Result;

use crate::lock;
use crate::routing::{PinFunction, PinMap};

#[derive(Debug, Default)]
struct AdcModel {
    block: Option<u8>,
    powered: bool,
    calibrated: bool,
    /// Level per input selector
    levels: HashMap<u8, i16>,
    routed: Vec<u8>,
    in_flight: Option<u8>,
    stalled: bool,
    conversions: u32,
}

impl AdcModel {
    fn sample(&self, input: u8) -> i16 {
        self.levels.get(&input).copied().unwrap_or(0)
    }
}

/// Backend for the ADC handle
#[derive(Debug, Clone)]
pub struct SimAdc {
    model: Arc<Mutex<AdcModel>>,
    routes: PinMap,
}

impl SimAdc {
    pub fn new(routes: PinMap) -> (Self, AnalogInputs) {
        let model = Arc::new(Mutex::new(AdcModel::default()));
        (
            Self {
                model: model.clone(),
                routes: routes.clone(),
            },
            AnalogInputs { model, routes },
        )
    }
}

impl AdcBackend for SimAdc {
    fn connect(&mut self, block: u8) -> Result<(), AdcError> {
        lock(&self.model).block = Some(block);
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut m = lock(&self.model);
        m.block = None;
        m.in_flight = None;
        m.routed.clear();
    }

    fn route(&mut self, pin: u8) -> Result<u8, AdcError> {
        let mut m = lock(&self.model);
        let block = m.block.unwrap_or(0);
        let route = self
            .routes
            .find_on(pin, PinFunction::AdcIn, block)
            .ok_or(AdcError::InvalidPin)?;
        m.routed.push(pin);
        Ok(route.channel)
    }

    fn unroute(&mut self, pin: u8) {
        lock(&self.model).routed.retain(|&p| p != pin);
    }

    fn set_powered(&mut self, on: bool) {
        let mut m = lock(&self.model);
        m.powered = on;
        // Calibration is lost with power
        if !on {
            m.calibrated = false;
        }
    }

    fn is_calibrated(&self) -> bool {
        lock(&self.model).calibrated
    }

    fn start_conversion(&mut self, input: u8) {
        lock(&self.model).in_flight = Some(input);
    }

    fn conversion(&mut self) -> Option<i16> {
        let mut m = lock(&self.model);
        if m.stalled {
            return None;
        }
        let input = m.in_flight?;
        m.conversions += 1;
        Some(m.sample(input))
    }

    fn stop(&mut self) {
        lock(&self.model).in_flight = None;
    }

    fn service_interrupt(&mut self) -> Option<i16> {
        let mut m = lock(&self.model);
        if !m.powered {
            return None;
        }
        if !m.calibrated {
            m.calibrated = true;
            return None;
        }
        if m.stalled {
            return None;
        }
        let input = m.in_flight.take()?;
        m.conversions += 1;
        Some(m.sample(input))
    }
}

/// Voltages on the analog pins
#[derive(Debug, Clone)]
pub struct AnalogInputs {
    model: Arc<Mutex<AdcModel>>,
    routes: PinMap,
}

impl AnalogInputs {
    /// Put a raw level on `pin`; returns false if the pin is no ADC input
    pub fn set_counts(&self, pin: u8, counts: i16) -> bool {
        let Some(route) = self.routes.find(pin, PinFunction::AdcIn) else {
            return false;
        };
        lock(&self.model).levels.insert(route.channel, counts);
        true
    }

    /// Put `uv` microvolts on `pin`, clamped to the converter range
    pub fn set_uv(&self, pin: u8, uv: i32) -> bool {
        let counts = i64::from(uv) * i64::from(COUNTS_PER_VOLT) / 1_000_000;
        let counts = counts.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16;
        self.set_counts(pin, counts)
    }

    /// Hold conversions in flight
    pub fn stall(&self, stalled: bool) {
        lock(&self.model).stalled = stalled;
    }

    pub fn is_powered(&self) -> bool {
        lock(&self.model).powered
    }

    pub fn is_calibrated(&self) -> bool {
        lock(&self.model).calibrated
    }

    /// Pins currently muxed to the converter
    pub fn routed(&self) -> Vec<u8> {
        lock(&self.model).routed.clone()
    }

    /// Conversions finished so far
    pub fn conversions(&self) -> u32 {
        lock(&self.model).conversions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_needs_power_and_an_interrupt() {
        let (mut adc, inputs) = SimAdc::new(PinMap::reference());
        adc.connect(0).unwrap();
        assert_eq!(adc.service_interrupt(), None);
        assert!(!inputs.is_calibrated());

        adc.set_powered(true);
        assert_eq!(adc.service_interrupt(), None);
        assert!(adc.is_calibrated());

        adc.set_powered(false);
        assert!(!adc.is_calibrated());
    }

    #[test]
    fn test_levels_follow_routing() {
        let (mut adc, inputs) = SimAdc::new(PinMap::reference());
        adc.connect(0).unwrap();
        assert_eq!(adc.route(10), Err(AdcError::InvalidPin));
        let input = adc.route(45).unwrap();
        assert_eq!(inputs.routed(), vec![45]);

        assert!(inputs.set_uv(45, 250_000));
        assert!(!inputs.set_counts(10, 5));
        adc.start_conversion(input);
        assert_eq!(adc.conversion(), Some(0x2000));

        inputs.stall(true);
        assert_eq!(adc.conversion(), None);
        assert_eq!(inputs.conversions(), 1);
    }
}
