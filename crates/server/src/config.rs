//! Server configuration
//!
//! The configuration is a JSON document. Recognized top-level keys:
//!
//! ```json
//! {
//!     "listen": ["127.0.0.1", 7890],
//!     "verbose": true,
//!     "color": { "gamma": 2.5, "whitepoint": [0.98, 1.0, 1.0] },
//!     "devices": [
//!         {
//!             "type": "fadecandy",
//!             "serial": "FC000001",
//!             "dither": true,
//!             "interpolate": true,
//!             "map": [ [0, 0, 0, 512] ]
//!         },
//!         {
//!             "type": "enttec",
//!             "serial": "EN075577",
//!             "map": [ [0, 0, "r", 0], [0, 0, "g", 1], [0, 0, "b", 2] ]
//!         }
//!     ]
//! }
//! ```
//!
//! Unknown keys are ignored. Without a config file the built-in default
//! applies: listen on 127.0.0.1:7890 and map OPC channel 0 onto all 512
//! pixels of any Fadecandy.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use protocol::ColorCorrection;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "ListenAddr::default")]
    pub listen: ListenAddr,

    #[serde(default)]
    pub verbose: bool,

    /// Global color correction, applied to every device without its own
    /// `color` override.
    #[serde(default)]
    pub color: Option<ColorCorrection>,

    /// Ordered device bindings; order decides which binding a freshly
    /// attached device matches first.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// `[host, port]` pair, serialized as a two-element JSON array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenAddr(pub String, pub u16);

impl Default for ListenAddr {
    fn default() -> Self {
        ListenAddr("127.0.0.1".to_string(), 7890)
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceConfig {
    Fadecandy {
        /// Match any Fadecandy when absent.
        #[serde(default)]
        serial: Option<String>,
        #[serde(default)]
        map: Vec<FcMapEntry>,
        #[serde(default)]
        color: Option<ColorCorrection>,
        /// Temporal dithering in firmware.
        #[serde(default = "default_true")]
        dither: bool,
        /// Keyframe interpolation in firmware.
        #[serde(default = "default_true")]
        interpolate: bool,
        /// None leaves the LED as a USB activity indicator; Some pins it.
        #[serde(default)]
        led: Option<bool>,
    },
    Enttec {
        #[serde(default)]
        serial: Option<String>,
        #[serde(default)]
        map: Vec<DmxMapEntry>,
        #[serde(default)]
        color: Option<ColorCorrection>,
    },
}

fn default_true() -> bool {
    true
}

/// Fadecandy map entry, one of:
/// - `[opcChannel, firstOpcPixel, firstDevicePixel, pixelCount]`
/// - `[opcChannel, firstOpcPixel, firstDevicePixel, pixelCount, [r,g,b]]`
///   with a per-entry color scale
/// - `[opcChannel, firstDevicePixel, pixelCount, "#rrggbb"]` painting a
///   constant color whenever the channel receives pixels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FcMapEntry {
    Range(u8, u32, u32, u32),
    ScaledRange(u8, u32, u32, u32, [f64; 3]),
    Constant(u8, u32, u32, String),
}

/// Enttec map entry: `[opcChannel, opcPixel, component, dmxChannel]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DmxMapEntry(pub u8, pub u32, pub Component, pub u32);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Component {
    #[serde(rename = "r")]
    Red,
    #[serde(rename = "g")]
    Green,
    #[serde(rename = "b")]
    Blue,
}

impl Component {
    pub fn index(self) -> usize {
        match self {
            Component::Red => 0,
            Component::Green => 1,
            Component::Blue => 2,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenAddr::default(),
            verbose: false,
            color: None,
            devices: vec![DeviceConfig::Fadecandy {
                serial: None,
                map: vec![FcMapEntry::Range(0, 0, 0, 512)],
                color: None,
                dither: true,
                interpolate: true,
                led: None,
            }],
        }
    }
}

impl Config {
    /// Load and validate a configuration file. Any failure here is
    /// fatal at startup.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        tracing::info!("Loaded configuration from: {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(color) = &self.color {
            validate_color(color).context("invalid global color section")?;
        }

        for (i, device) in self.devices.iter().enumerate() {
            match device {
                DeviceConfig::Fadecandy { color, map, .. } => {
                    if let Some(c) = color {
                        validate_color(c)
                            .with_context(|| format!("invalid color on device entry {}", i))?;
                    }
                    for entry in map {
                        if let FcMapEntry::Constant(_, _, _, spec) = entry {
                            parse_color_literal(spec).with_context(|| {
                                format!("invalid constant color on device entry {}", i)
                            })?;
                        }
                    }
                }
                DeviceConfig::Enttec { color, .. } => {
                    if let Some(c) = color {
                        validate_color(c)
                            .with_context(|| format!("invalid color on device entry {}", i))?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Address string for the TCP listener.
    pub fn listen_addr(&self) -> String {
        self.listen.to_string()
    }
}

fn validate_color(color: &ColorCorrection) -> Result<()> {
    if !(color.gamma.is_finite() && color.gamma > 0.0) {
        return Err(anyhow!("gamma must be a positive number, got {}", color.gamma));
    }
    for (i, &w) in color.whitepoint.iter().enumerate() {
        if !(0.0..=1.0).contains(&w) {
            return Err(anyhow!("whitepoint[{}] must be within [0, 1], got {}", i, w));
        }
    }
    Ok(())
}

/// Parse a `#rrggbb` color literal.
pub fn parse_color_literal(spec: &str) -> Result<[u8; 3]> {
    let hex = spec
        .strip_prefix('#')
        .ok_or_else(|| anyhow!("color must look like \"#rrggbb\", got {:?}", spec))?;
    if hex.len() != 6 {
        return Err(anyhow!("color must have six hex digits, got {:?}", spec));
    }
    let value = u32::from_str_radix(hex, 16)
        .map_err(|_| anyhow!("color is not valid hex: {:?}", spec))?;
    Ok([(value >> 16) as u8, (value >> 8) as u8, value as u8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_maps_broadcast_to_any_fadecandy() {
        let config = Config::default();
        assert_eq!(config.listen, ListenAddr("127.0.0.1".into(), 7890));
        assert_eq!(config.devices.len(), 1);
        let DeviceConfig::Fadecandy { serial, map, .. } = &config.devices[0] else {
            panic!("expected fadecandy binding");
        };
        assert!(serial.is_none());
        assert_eq!(map[0], FcMapEntry::Range(0, 0, 0, 512));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_document_parses() {
        let json = r##"{
            "listen": ["0.0.0.0", 7890],
            "verbose": true,
            "color": { "gamma": 2.5, "whitepoint": [0.98, 1.0, 1.0] },
            "devices": [
                {
                    "type": "fadecandy",
                    "serial": "FC000001",
                    "dither": false,
                    "led": true,
                    "map": [
                        [0, 0, 0, 60],
                        [1, 0, 60, 60, [1.0, 0.8, 0.8]],
                        [2, 120, 8, "#202020"]
                    ]
                },
                {
                    "type": "enttec",
                    "serial": "EN075577",
                    "map": [ [0, 0, "r", 0], [0, 0, "g", 1], [0, 0, "b", 2] ]
                }
            ]
        }"##;

        let config: Config = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.listen_addr(), "0.0.0.0:7890");
        assert!(config.verbose);
        assert_eq!(config.color.unwrap().gamma, 2.5);

        let DeviceConfig::Fadecandy { map, dither, led, .. } = &config.devices[0] else {
            panic!("expected fadecandy");
        };
        assert!(!dither);
        assert_eq!(*led, Some(true));
        assert_eq!(map[0], FcMapEntry::Range(0, 0, 0, 60));
        assert_eq!(map[1], FcMapEntry::ScaledRange(1, 0, 60, 60, [1.0, 0.8, 0.8]));
        assert_eq!(map[2], FcMapEntry::Constant(2, 120, 8, "#202020".into()));

        let DeviceConfig::Enttec { map, .. } = &config.devices[1] else {
            panic!("expected enttec");
        };
        assert_eq!(map[0], DmxMapEntry(0, 0, Component::Red, 0));
    }

    #[test]
    fn unknown_keys_tolerated() {
        let json = r#"{ "listen": ["127.0.0.1", 7890], "future_option": 42 }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.devices.is_empty());
    }

    #[test]
    fn whitepoint_out_of_range_rejected() {
        let json = r#"{ "color": { "gamma": 2.2, "whitepoint": [1.5, 1.0, 1.0] } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_gamma_rejected() {
        let json = r#"{ "color": { "gamma": 0.0 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn color_literals() {
        assert_eq!(parse_color_literal("#ff8000").unwrap(), [0xFF, 0x80, 0x00]);
        assert_eq!(parse_color_literal("#000000").unwrap(), [0, 0, 0]);
        assert!(parse_color_literal("ff8000").is_err());
        assert!(parse_color_literal("#ff80").is_err());
        assert!(parse_color_literal("#zzzzzz").is_err());
    }

    #[test]
    fn bad_constant_color_rejected_at_validate() {
        let json = r#"{ "devices": [
            { "type": "fadecandy", "map": [ [0, 0, 8, "oops"] ] }
        ]}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }
}
