//! Open Pixel Control protocol for pixelbridge
//!
//! This crate defines the OPC wire protocol spoken over TCP: the message
//! type, a streaming framer that reassembles messages from fragmented
//! reads, and the Fadecandy System Exclusive extension messages.
//!
//! # Wire format
//!
//! Every OPC message is a 4-byte header followed by a payload:
//!
//! ```text
//! [channel: u8][command: u8][length: u16 (big-endian)][payload: length bytes]
//! ```
//!
//! # Example
//!
//! ```
//! use protocol::{Framer, commands};
//!
//! let mut framer = Framer::new();
//!
//! // One Set Pixel Colors message for a single red pixel, split over
//! // two reads.
//! let wire = [0x01, 0x00, 0x00, 0x03, 0xFF, 0x00, 0x00];
//! assert!(framer.push(&wire[..4]).unwrap().is_empty());
//!
//! let messages = framer.push(&wire[4..]).unwrap();
//! assert_eq!(messages.len(), 1);
//! assert_eq!(messages[0].channel, 1);
//! assert_eq!(messages[0].command, commands::SET_PIXEL_COLORS);
//! assert_eq!(messages[0].data, vec![0xFF, 0x00, 0x00]);
//! ```

pub mod error;
pub mod framing;
pub mod message;
pub mod sysex;

pub use error::{ProtocolError, Result};
pub use framing::{Framer, MAX_BUFFERED_BYTES};
pub use message::{commands, HEADER_SIZE, MAX_PAYLOAD_SIZE, OpcMessage};
pub use sysex::{
    parse_fadecandy_sysex, subcommands, ColorCorrection, FadecandySysEx, FADECANDY_SYSTEM_ID,
};
