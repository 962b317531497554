//! Pin routing
//!
//! Which pin can carry which peripheral signal, and on which block or
//! channel. The simulated blocks refuse any pin the table does not list
//! for the requested signal, the way the chip's pin mux would.
//!
//! ```toml
//! [[routes]]
//! pin = 10
//! block = 0
//! function = "spi_clk"
//! ```

use serde::Deserialize;

/// Signal a pin can be muxed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinFunction {
    SpiClk,
    SpiMosi,
    SpiMiso,
    SpiSsel,
    TdmTxSck,
    TdmTxWs,
    TdmTxSd,
    TdmRxSck,
    TdmRxWs,
    TdmRxSd,
    TdmMclk,
    SdioCmd,
    SdioClk,
    SdioData,
    PdmClk,
    PdmData,
    /// Analog microphone, positive side
    MicP,
    AdcIn,
    CompInP,
    CompInN,
}

/// One legal pin/signal pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PinRoute {
    pub pin: u8,
    #[serde(default)]
    pub block: u8,
    /// Input selector or comparator channel; zero for digital signals
    #[serde(default)]
    pub channel: u8,
    pub function: PinFunction,
}

impl PinRoute {
    pub const fn new(pin: u8, block: u8, channel: u8, function: PinFunction) -> Self {
        Self {
            pin,
            block,
            channel,
            function,
        }
    }
}

/// Routing table of a part
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct PinMap(Vec<PinRoute>);

impl Default for PinMap {
    fn default() -> Self {
        Self::reference()
    }
}

impl PinMap {
    pub fn new(routes: Vec<PinRoute>) -> Self {
        Self(routes)
    }

    /// Routing of the reference part
    pub fn reference() -> Self {
        use PinFunction::*;

        let mut routes = Vec::new();
        for block in 0..3 {
            routes.push(PinRoute::new(10, block, 0, SpiClk));
            routes.push(PinRoute::new(11, block, 0, SpiMosi));
            routes.push(PinRoute::new(12, block, 0, SpiMiso));
            for ssel in 13..=15 {
                routes.push(PinRoute::new(ssel, block, 0, SpiSsel));
            }
        }
        for (pin, function) in [
            (20, TdmTxSck),
            (21, TdmTxWs),
            (22, TdmTxSd),
            (23, TdmRxSck),
            (24, TdmRxWs),
            (25, TdmRxSd),
            (26, TdmMclk),
            (30, SdioCmd),
            (31, SdioClk),
            (16, PdmClk),
            (17, PdmData),
            (52, MicP),
        ] {
            routes.push(PinRoute::new(pin, 0, 0, function));
        }
        for pin in 32..=35 {
            routes.push(PinRoute::new(pin, 0, 0, SdioData));
        }
        for (input, pin) in (44..=51).enumerate() {
            routes.push(PinRoute::new(pin, 0, input as u8, AdcIn));
        }
        for (pin, channel) in [(46, 0), (47, 0), (50, 1), (51, 1), (52, 0)] {
            routes.push(PinRoute::new(pin, 0, channel, CompInP));
        }
        for (pin, channel) in [(44, 0), (45, 0), (48, 1), (49, 1)] {
            routes.push(PinRoute::new(pin, 0, channel, CompInN));
        }
        Self(routes)
    }

    pub fn routes(&self) -> &[PinRoute] {
        &self.0
    }

    /// Route for `pin` carrying `function`, on any block
    pub fn find(&self, pin: u8, function: PinFunction) -> Option<&PinRoute> {
        self.0
            .iter()
            .find(|r| r.pin == pin && r.function == function)
    }

    /// Route for `pin` carrying `function` on `block`
    pub fn find_on(&self, pin: u8, function: PinFunction, block: u8) -> Option<&PinRoute> {
        self.0
            .iter()
            .find(|r| r.pin == pin && r.function == function && r.block == block)
    }

    pub fn supports(&self, pin: u8, function: PinFunction, block: u8) -> bool {
        self.find_on(pin, function, block).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_routes() {
        let map = PinMap::reference();
        assert!(map.supports(10, PinFunction::SpiClk, 2));
        assert!(!map.supports(10, PinFunction::SpiClk, 3));
        assert!(!map.supports(11, PinFunction::SpiClk, 0));
        assert_eq!(map.find(47, PinFunction::AdcIn).map(|r| r.channel), Some(3));
        assert_eq!(map.find(50, PinFunction::CompInP).map(|r| r.channel), Some(1));
        assert!(map.find(40, PinFunction::AdcIn).is_none());
    }

    #[test]
    fn test_routes_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            routes: PinMap,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[routes]]
            pin = 3
            function = "spi_clk"

            [[routes]]
            pin = 4
            block = 1
            function = "adc_in"
            channel = 2
            "#,
        )
        .unwrap();
        assert_eq!(
            doc.routes.routes(),
            &[
                PinRoute::new(3, 0, 0, PinFunction::SpiClk),
                PinRoute::new(4, 1, 2, PinFunction::AdcIn),
            ]
        );
        assert!(toml::from_str::<Doc>("[[routes]]\npin = 3\nfunction = \"uart_tx\"").is_err());
    }
}
