//! Enttec DMX adapter driver
//!
//! An FTDI-based widget carrying a fixed 24-channel DMX universe over a
//! bulk OUT endpoint. The protocol is slow, so there is no double
//! buffering: writes coalesce into one channel array and the latest
//! state is resubmitted whenever a transfer completes with the dirty
//! flag set.
//!
//! Frame layout (30 bytes):
//!
//! ```text
//! 7E 06 19 00 00   start delimiter, send-DMX label, length 25 LE, DMX start code
//! <24 channels>
//! E7               end delimiter
//! ```

use common::{DeviceInfo, DeviceKey, OutPort, TransferStatus, TransferToken, UsbCommand};
use protocol::ColorCorrection;
use tracing::{debug, trace, warn};

use super::{DeviceDescription, DeviceHealth};

pub const VENDOR_ID: u16 = 0x0403;
pub const PRODUCT_ID: u16 = 0x6001;

/// The FTDI vendor/product pair is generic; Enttec widgets are told
/// apart by this serial number prefix.
pub const SERIAL_PREFIX: &str = "EN";

/// Size of the universe this adapter exposes.
pub const NUM_CHANNELS: usize = 24;

const OUT_ENDPOINT: u8 = 0x02;

const START_OF_MESSAGE: u8 = 0x7E;
const END_OF_MESSAGE: u8 = 0xE7;
const LABEL_SEND_DMX: u8 = 0x06;
const DMX_START_CODE: u8 = 0x00;
const FRAME_SIZE: usize = 5 + NUM_CHANNELS + 1;

// FTDI SIO setup requests, issued once at attach: chip reset, 250 kbaud
// (3 MHz base clock / divisor 12), 8 data bits + 2 stop bits.
const FTDI_REQTYPE_OUT: u8 = 0x40;
const FTDI_SIO_RESET: u8 = 0x00;
const FTDI_SIO_SET_BAUD_RATE: u8 = 0x03;
const FTDI_SIO_SET_DATA: u8 = 0x04;
const FTDI_BAUD_250K_DIVISOR: u16 = 12;
const FTDI_DATA_8N2: u16 = 0x1008;

const MAX_SUBMIT_FAILURES: u32 = 4096;

#[derive(Debug)]
pub struct EnttecDevice {
    key: DeviceKey,
    serial: String,
    port: OutPort,

    channels: [u8; NUM_CHANNELS],
    /// Host-side whitepoint scale; gamma correction does not apply to
    /// DMX fixtures.
    scale: [f64; 3],

    dirty: bool,
    in_flight: Option<TransferToken>,
    setup_sent: bool,

    next_token: u64,
    submit_failures: u32,
}

impl EnttecDevice {
    pub fn matches(vendor: u16, product: u16) -> bool {
        vendor == VENDOR_ID && product == PRODUCT_ID
    }

    pub fn attach(info: &DeviceInfo, port: OutPort) -> Self {
        Self {
            key: info.key,
            serial: info.serial.clone().unwrap_or_default(),
            port,
            channels: [0; NUM_CHANNELS],
            scale: [1.0; 3],
            dirty: false,
            in_flight: None,
            setup_sent: false,
            next_token: 0,
            submit_failures: 0,
        }
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    pub fn describe(&self) -> DeviceDescription {
        DeviceDescription {
            kind: "enttec",
            serial: self.serial.clone(),
        }
    }

    /// Current value of one universe slot, for tests and logging.
    pub fn channel_value(&self, channel: usize) -> Option<u8> {
        self.channels.get(channel).copied()
    }

    /// Default layout: pixel i occupies channels 3i..3i+3. Pixels past
    /// the universe are dropped silently.
    pub fn set_pixel(&mut self, index: usize, rgb: [u8; 3]) {
        for (component, &value) in rgb.iter().enumerate() {
            let Some(channel) = index.checked_mul(3).map(|c| c + component) else {
                return;
            };
            self.set_channel(channel, component, value);
        }
    }

    /// Write one channel, applying the component's whitepoint scale.
    /// Component selects the scale (0 red, 1 green, 2 blue).
    pub fn set_channel(&mut self, channel: usize, component: usize, value: u8) {
        let Some(slot) = self.channels.get_mut(channel) else {
            return;
        };
        let scale = self.scale.get(component).copied().unwrap_or(1.0);
        let corrected = (f64::from(value) * scale).round().clamp(0.0, 255.0) as u8;
        if *slot != corrected {
            *slot = corrected;
            self.dirty = true;
        }
    }

    pub fn set_color_correction(&mut self, correction: &ColorCorrection) {
        self.scale = correction.whitepoint;
    }

    pub fn flush(&mut self) -> DeviceHealth {
        if !self.setup_sent {
            if let Err(health) = self.submit_setup() {
                return health;
            }
        }

        if self.dirty && self.in_flight.is_none() {
            let token = self.take_token();
            match self.submit_frame(token) {
                Ok(()) => {
                    trace!("{}: DMX frame submitted", self.key);
                    self.in_flight = Some(token);
                    self.dirty = false;
                }
                Err(health) => return health,
            }
        }

        DeviceHealth::Alive
    }

    pub fn on_transfer_complete(&mut self, token: TransferToken, status: TransferStatus) -> DeviceHealth {
        match status {
            TransferStatus::Ok => {
                if self.in_flight == Some(token) {
                    self.in_flight = None;
                }
                // Coalesce: whatever state accumulated while the frame
                // was on the wire goes out as one new frame.
                self.flush()
            }
            TransferStatus::Cancelled => {
                self.in_flight = None;
                DeviceHealth::Alive
            }
            TransferStatus::Stall | TransferStatus::IoError => {
                warn!("{}: transfer failed ({:?})", self.key, status);
                DeviceHealth::Failed
            }
        }
    }

    /// Queue the FTDI setup sequence ahead of any DMX frame.
    fn submit_setup(&mut self) -> Result<(), DeviceHealth> {
        let requests = [
            (FTDI_SIO_RESET, 0u16),
            (FTDI_SIO_SET_BAUD_RATE, FTDI_BAUD_250K_DIVISOR),
            (FTDI_SIO_SET_DATA, FTDI_DATA_8N2),
        ];

        for (request, value) in requests {
            let token = self.take_token();
            let cmd = UsbCommand::SubmitControl {
                key: self.key,
                request_type: FTDI_REQTYPE_OUT,
                request,
                value,
                index: 0,
                token,
            };
            if let Err(e) = self.port.submit(cmd) {
                return Err(self.submit_error(e));
            }
        }

        debug!("{}: FTDI setup queued", self.key);
        self.setup_sent = true;
        self.submit_failures = 0;
        Ok(())
    }

    fn submit_frame(&mut self, token: TransferToken) -> Result<(), DeviceHealth> {
        let mut frame = Vec::with_capacity(FRAME_SIZE);
        frame.push(START_OF_MESSAGE);
        frame.push(LABEL_SEND_DMX);
        let payload_len = (NUM_CHANNELS + 1) as u16;
        frame.extend_from_slice(&payload_len.to_le_bytes());
        frame.push(DMX_START_CODE);
        frame.extend_from_slice(&self.channels);
        frame.push(END_OF_MESSAGE);

        match self.port.submit(UsbCommand::SubmitOut {
            key: self.key,
            endpoint: OUT_ENDPOINT,
            data: frame,
            token,
        }) {
            Ok(()) => {
                self.submit_failures = 0;
                Ok(())
            }
            Err(e) => Err(self.submit_error(e)),
        }
    }

    fn submit_error(&mut self, err: common::Error) -> DeviceHealth {
        match err {
            common::Error::ChannelFull => {
                self.submit_failures += 1;
                if self.submit_failures >= MAX_SUBMIT_FAILURES {
                    warn!("{}: submission retry budget exhausted", self.key);
                    DeviceHealth::Failed
                } else {
                    DeviceHealth::Alive
                }
            }
            _ => DeviceHealth::Failed,
        }
    }

    fn take_token(&mut self) -> TransferToken {
        self.next_token += 1;
        TransferToken(self.next_token)
    }
}
