//! Mapping engine
//!
//! Compiles the configuration's `devices` list into a routing table
//! consulted on every Set Pixel Colors message. Compilation happens at
//! load time; the hot path walks plain vectors and never touches the
//! raw JSON document.
//!
//! Channel rule: an entry matches exactly the channel it declares.
//! Channel 0 works as a broadcast by convention because configurations
//! bind a channel-0 entry for every device they want covered; nothing
//! routes a channel-0 message to entries declared on other channels.

use protocol::{ColorCorrection, OpcMessage};
use tracing::warn;

use crate::config::{parse_color_literal, Config, DeviceConfig, FcMapEntry};
use crate::devices::{fadecandy, Device};

/// One compiled routing rule.
#[derive(Debug, Clone, PartialEq)]
pub enum MapEntry {
    /// A contiguous OPC pixel slice copied to a device pixel slice,
    /// optionally scaled per component.
    PixelRange {
        channel: u8,
        src_start: usize,
        dst_start: usize,
        count: usize,
        scale: Option<[f64; 3]>,
    },

    /// A constant color painted over a device pixel slice whenever the
    /// channel receives pixel data.
    ConstantColor {
        channel: u8,
        dst_start: usize,
        count: usize,
        color: [u8; 3],
    },

    /// A single color component routed to one DMX channel.
    DmxComponent {
        channel: u8,
        src_pixel: usize,
        component: usize,
        dmx_channel: usize,
    },
}

impl MapEntry {
    fn channel(&self) -> u8 {
        match self {
            MapEntry::PixelRange { channel, .. }
            | MapEntry::ConstantColor { channel, .. }
            | MapEntry::DmxComponent { channel, .. } => *channel,
        }
    }

    /// Whether a message on `message_channel` selects this entry.
    pub fn applies_to(&self, message_channel: u8) -> bool {
        self.channel() == message_channel
    }
}

/// Firmware options carried by a Fadecandy binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareOptions {
    pub dither: bool,
    pub interpolate: bool,
    pub led: Option<bool>,
}

impl FirmwareOptions {
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if !self.dither {
            flags |= fadecandy::flags::NO_DITHERING;
        }
        if !self.interpolate {
            flags |= fadecandy::flags::NO_INTERPOLATION;
        }
        if let Some(on) = self.led {
            flags |= fadecandy::flags::MANUAL_LED;
            if on {
                flags |= fadecandy::flags::LED_ON;
            }
        }
        flags
    }
}

/// One device binding: which hardware it selects and how OPC data maps
/// onto it.
#[derive(Debug, Clone)]
pub struct DeviceBinding {
    /// Driver kind, as reported by `Device::describe`.
    pub kind: &'static str,
    /// Exact serial match; None matches any device of the kind.
    pub serial: Option<String>,
    /// Per-device color override (replaces the global section).
    pub color: Option<ColorCorrection>,
    /// Firmware flags, Fadecandy only.
    pub firmware: Option<FirmwareOptions>,
    pub entries: Vec<MapEntry>,
}

impl DeviceBinding {
    fn selects(&self, device: &Device) -> bool {
        let description = device.describe();
        if self.kind != description.kind {
            return false;
        }
        match &self.serial {
            Some(serial) => *serial == description.serial,
            None => true,
        }
    }
}

/// The compiled routing table. Replaced wholesale on config reload;
/// dispatch in progress keeps using the table it started with.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    bindings: Vec<DeviceBinding>,
}

impl Mapping {
    /// Compile a configuration. Entries that cannot be compiled (bad
    /// constant color literals on an unvalidated config) are skipped
    /// with a warning rather than failing the reload.
    pub fn compile(config: &Config) -> Self {
        let bindings = config
            .devices
            .iter()
            .map(|device| match device {
                DeviceConfig::Fadecandy {
                    serial,
                    map,
                    color,
                    dither,
                    interpolate,
                    led,
                } => DeviceBinding {
                    kind: "fadecandy",
                    serial: serial.clone(),
                    color: *color,
                    firmware: Some(FirmwareOptions {
                        dither: *dither,
                        interpolate: *interpolate,
                        led: *led,
                    }),
                    entries: map.iter().filter_map(compile_fc_entry).collect(),
                },
                DeviceConfig::Enttec { serial, map, color } => DeviceBinding {
                    kind: "enttec",
                    serial: serial.clone(),
                    color: *color,
                    firmware: None,
                    entries: map
                        .iter()
                        .map(|entry| MapEntry::DmxComponent {
                            channel: entry.0,
                            src_pixel: entry.1 as usize,
                            component: entry.2.index(),
                            dmx_channel: entry.3 as usize,
                        })
                        .collect(),
                },
            })
            .collect();

        Self { bindings }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// First binding that selects the device, in declaration order.
    pub fn bind(&self, device: &Device) -> Option<usize> {
        self.bindings.iter().position(|b| b.selects(device))
    }

    pub fn binding(&self, index: usize) -> &DeviceBinding {
        &self.bindings[index]
    }

    /// The color correction a device should run with: its binding's
    /// override when present, else the global section, else identity.
    pub fn effective_color(
        &self,
        binding: Option<usize>,
        global: Option<&ColorCorrection>,
    ) -> ColorCorrection {
        binding
            .and_then(|i| self.bindings[i].color)
            .or_else(|| global.copied())
            .unwrap_or_default()
    }
}

fn compile_fc_entry(entry: &FcMapEntry) -> Option<MapEntry> {
    match entry {
        FcMapEntry::Range(channel, src, dst, count) => Some(MapEntry::PixelRange {
            channel: *channel,
            src_start: *src as usize,
            dst_start: *dst as usize,
            count: *count as usize,
            scale: None,
        }),
        FcMapEntry::ScaledRange(channel, src, dst, count, scale) => Some(MapEntry::PixelRange {
            channel: *channel,
            src_start: *src as usize,
            dst_start: *dst as usize,
            count: *count as usize,
            scale: Some(*scale),
        }),
        FcMapEntry::Constant(channel, dst, count, spec) => match parse_color_literal(spec) {
            Ok(color) => Some(MapEntry::ConstantColor {
                channel: *channel,
                dst_start: *dst as usize,
                count: *count as usize,
                color,
            }),
            Err(e) => {
                warn!("skipping map entry with bad color literal: {}", e);
                None
            }
        },
    }
}

/// Route one Set Pixel Colors message through a binding into a device.
/// Returns true when anything was written (the device needs a flush).
/// Entries run in declaration order, so a later entry covering the same
/// destination pixel wins.
pub fn apply_message(binding: &DeviceBinding, message: &OpcMessage, device: &mut Device) -> bool {
    let mut touched = false;

    for entry in &binding.entries {
        if !entry.applies_to(message.channel) {
            continue;
        }

        match entry {
            MapEntry::PixelRange {
                src_start,
                dst_start,
                count,
                scale,
                ..
            } => {
                for i in 0..*count {
                    // Pixels past the end of the payload do not exist;
                    // the payload is contiguous, so stop at the first.
                    let Some(mut rgb) = message.pixel(src_start + i) else {
                        break;
                    };
                    if let Some(scale) = scale {
                        rgb = scale_rgb(rgb, scale);
                    }
                    device.set_pixel(dst_start + i, rgb);
                    touched = true;
                }
            }

            MapEntry::ConstantColor {
                dst_start,
                count,
                color,
                ..
            } => {
                for i in 0..*count {
                    device.set_pixel(dst_start + i, *color);
                    touched = true;
                }
            }

            MapEntry::DmxComponent {
                src_pixel,
                component,
                dmx_channel,
                ..
            } => {
                if let Some(rgb) = message.pixel(*src_pixel) {
                    if let Device::Enttec(dmx) = device {
                        dmx.set_channel(*dmx_channel, *component, rgb[*component]);
                        touched = true;
                    }
                }
            }
        }
    }

    touched
}

fn scale_rgb(rgb: [u8; 3], scale: &[f64; 3]) -> [u8; 3] {
    let mut out = [0u8; 3];
    for c in 0..3 {
        out[c] = (f64::from(rgb[c]) * scale[c]).round().clamp(0.0, 255.0) as u8;
    }
    out
}
