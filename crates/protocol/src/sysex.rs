//! Fadecandy System Exclusive messages
//!
//! A System Exclusive payload opens with a big-endian 16-bit system id.
//! System id 0x0001 is the Fadecandy extension namespace; its payloads
//! continue with a one-byte subcommand followed by subcommand data.
//! Foreign system ids and unknown subcommands are ignored by contract.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// System id of the Fadecandy extension namespace.
pub const FADECANDY_SYSTEM_ID: u16 = 0x0001;

/// Fadecandy SysEx subcommand bytes.
pub mod subcommands {
    /// Data is a JSON object `{"gamma": g, "whitepoint": [r, g, b]}`.
    pub const SET_COLOR_CORRECTION: u8 = 0x01;

    /// Data is one firmware flag byte.
    pub const SET_FIRMWARE_CONFIG: u8 = 0x02;
}

/// Global color correction: a gamma exponent and a per-component
/// whitepoint scale in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorCorrection {
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_whitepoint")]
    pub whitepoint: [f64; 3],
}

fn default_gamma() -> f64 {
    1.0
}

fn default_whitepoint() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

impl Default for ColorCorrection {
    fn default() -> Self {
        Self {
            gamma: default_gamma(),
            whitepoint: default_whitepoint(),
        }
    }
}

impl ColorCorrection {
    /// True for the identity correction (scale 1, gamma 1), which leaves
    /// pixel values unchanged up to 16-bit rounding.
    pub fn is_identity(&self) -> bool {
        self.gamma == 1.0 && self.whitepoint == [1.0, 1.0, 1.0]
    }
}

/// A recognized Fadecandy SysEx message.
#[derive(Debug, Clone, PartialEq)]
pub enum FadecandySysEx {
    SetColorCorrection(ColorCorrection),
    SetFirmwareConfig(u8),
}

/// Parse a System Exclusive payload.
///
/// Returns `Ok(None)` for foreign system ids and unrecognized
/// subcommands; those are tolerated, not errors. A payload too short to
/// carry a system id, or a color correction body that is not valid JSON,
/// is an error the caller may log before ignoring the message.
pub fn parse_fadecandy_sysex(data: &[u8]) -> Result<Option<FadecandySysEx>> {
    if data.len() < 2 {
        return Err(ProtocolError::TruncatedSysEx(data.len()));
    }

    let system_id = u16::from_be_bytes([data[0], data[1]]);
    if system_id != FADECANDY_SYSTEM_ID {
        return Ok(None);
    }

    let Some((&subcommand, body)) = data[2..].split_first() else {
        // A bare system id with no subcommand carries nothing to do.
        return Ok(None);
    };

    match subcommand {
        subcommands::SET_COLOR_CORRECTION => {
            let correction: ColorCorrection = serde_json::from_slice(body)?;
            Ok(Some(FadecandySysEx::SetColorCorrection(correction)))
        }
        subcommands::SET_FIRMWARE_CONFIG => {
            let flags = body.first().copied().unwrap_or(0);
            Ok(Some(FadecandySysEx::SetFirmwareConfig(flags)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sysex_payload(subcommand: u8, body: &[u8]) -> Vec<u8> {
        let mut data = FADECANDY_SYSTEM_ID.to_be_bytes().to_vec();
        data.push(subcommand);
        data.extend_from_slice(body);
        data
    }

    #[test]
    fn color_correction_json() {
        let body = br#"{"gamma": 2.5, "whitepoint": [1.0, 0.9, 0.8]}"#;
        let parsed =
            parse_fadecandy_sysex(&sysex_payload(subcommands::SET_COLOR_CORRECTION, body))
                .unwrap();
        let Some(FadecandySysEx::SetColorCorrection(cc)) = parsed else {
            panic!("expected color correction, got {:?}", parsed);
        };
        assert_eq!(cc.gamma, 2.5);
        assert_eq!(cc.whitepoint, [1.0, 0.9, 0.8]);
    }

    #[test]
    fn color_correction_defaults() {
        let parsed =
            parse_fadecandy_sysex(&sysex_payload(subcommands::SET_COLOR_CORRECTION, b"{}"))
                .unwrap();
        assert_eq!(
            parsed,
            Some(FadecandySysEx::SetColorCorrection(ColorCorrection::default()))
        );
        assert!(ColorCorrection::default().is_identity());
    }

    #[test]
    fn firmware_config_flags() {
        let parsed = parse_fadecandy_sysex(&sysex_payload(subcommands::SET_FIRMWARE_CONFIG, &[0x03]))
            .unwrap();
        assert_eq!(parsed, Some(FadecandySysEx::SetFirmwareConfig(0x03)));
    }

    #[test]
    fn foreign_system_id_ignored() {
        let parsed = parse_fadecandy_sysex(&[0xBE, 0xEF, 0x01, 0x02]).unwrap();
        assert_eq!(parsed, None);
    }

    #[test]
    fn unknown_subcommand_ignored() {
        let parsed = parse_fadecandy_sysex(&sysex_payload(0x7F, &[1, 2, 3])).unwrap();
        assert_eq!(parsed, None);
    }

    #[test]
    fn truncated_payload_is_error() {
        assert!(parse_fadecandy_sysex(&[0x00]).is_err());
    }

    #[test]
    fn bad_json_is_error() {
        let data = sysex_payload(subcommands::SET_COLOR_CORRECTION, b"{not json");
        assert!(matches!(
            parse_fadecandy_sysex(&data),
            Err(ProtocolError::MalformedColorCorrection(_))
        ));
    }
}
