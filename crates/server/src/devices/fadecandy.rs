//! Fadecandy LED controller driver
//!
//! The controller drives up to 512 WS2811 pixels and runs its own color
//! pipeline in firmware (gamma LUT lookup, interpolation, temporal
//! dithering). The host ships three packet types over one bulk OUT
//! endpoint, all 64 bytes, distinguished by the control byte:
//!
//! ```text
//! bits 7:6  packet type   (00 framebuffer, 01 LUT, 10 config)
//! bit  5    final packet of its sequence
//! bits 4:0  packet index within the sequence
//! ```
//!
//! A framebuffer sequence is 25 packets of 21 RGB triplets; a LUT
//! sequence is 25 packets of 31 little-endian u16 entries (257 entries
//! per color channel). The driver keeps two framebuffer generations and
//! submits whole sequences as single transfers, one per logical stream:
//! pixel frames on one, LUT/config on the other.

use common::{DeviceInfo, DeviceKey, OutPort, TransferStatus, TransferToken, UsbCommand};
use protocol::ColorCorrection;
use tracing::{debug, trace, warn};

use super::{DeviceDescription, DeviceHealth};

pub const VENDOR_ID: u16 = 0x1d50;
pub const PRODUCT_ID: u16 = 0x607a;

/// Nominal strip capacity; the pixel count is fixed at attach time.
pub const NUM_PIXELS: usize = 512;

const OUT_ENDPOINT: u8 = 0x01;

const PACKET_SIZE: usize = 64;
const PIXELS_PER_PACKET: usize = 21;
const FRAME_PACKETS: usize = NUM_PIXELS.div_ceil(PIXELS_PER_PACKET);

const LUT_CHANNEL_ENTRIES: usize = 257;
const LUT_TOTAL_ENTRIES: usize = LUT_CHANNEL_ENTRIES * 3;
const LUT_ENTRIES_PER_PACKET: usize = 31;
const LUT_PACKETS: usize = LUT_TOTAL_ENTRIES.div_ceil(LUT_ENTRIES_PER_PACKET);

const TYPE_FRAMEBUFFER: u8 = 0x00;
const TYPE_LUT: u8 = 0x40;
const TYPE_CONFIG: u8 = 0x80;
const FINAL_BIT: u8 = 0x20;

/// Firmware configuration flag byte.
pub mod flags {
    /// Disable temporal dithering.
    pub const NO_DITHERING: u8 = 0x01;
    /// Disable keyframe interpolation.
    pub const NO_INTERPOLATION: u8 = 0x02;
    /// Take the activity LED under manual control.
    pub const MANUAL_LED: u8 = 0x04;
    /// Manual LED value (with MANUAL_LED set).
    pub const LED_ON: u8 = 0x08;
}

/// Consecutive failed submission attempts tolerated before the device
/// is declared dead.
const MAX_SUBMIT_FAILURES: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LutState {
    /// The firmware table does not match the latched correction.
    NeedsUpload,
    /// An upload is in flight on the control stream.
    Uploading,
    /// Firmware holds the latched correction.
    Current,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlTransfer {
    Lut,
    Config,
}

#[derive(Debug)]
pub struct FcDevice {
    key: DeviceKey,
    serial: String,
    port: OutPort,

    color: ColorCorrection,
    firmware_flags: u8,
    flags_pending: bool,

    lut: LutState,
    /// True once the first LUT upload completed after attach. Pixel
    /// frames are held back until then.
    configured: bool,

    /// Front buffer: contents of the frame currently (or last) in
    /// flight. Back buffer: the frame being composed. Components are
    /// the 16-bit expansion of the 8-bit OPC values.
    front: Vec<[u16; 3]>,
    back: Vec<[u16; 3]>,
    back_dirty: bool,

    frame_in_flight: Option<TransferToken>,
    control_in_flight: Option<(TransferToken, ControlTransfer)>,

    next_token: u64,
    submit_failures: u32,
}

impl FcDevice {
    pub fn matches(vendor: u16, product: u16) -> bool {
        vendor == VENDOR_ID && product == PRODUCT_ID
    }

    pub fn attach(info: &DeviceInfo, port: OutPort) -> Self {
        Self {
            key: info.key,
            serial: info.serial.clone().unwrap_or_default(),
            port,
            color: ColorCorrection::default(),
            firmware_flags: 0,
            flags_pending: false,
            lut: LutState::NeedsUpload,
            configured: false,
            front: vec![[0; 3]; NUM_PIXELS],
            back: vec![[0; 3]; NUM_PIXELS],
            back_dirty: false,
            frame_in_flight: None,
            control_in_flight: None,
            next_token: 0,
            submit_failures: 0,
        }
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    pub fn describe(&self) -> DeviceDescription {
        DeviceDescription {
            kind: "fadecandy",
            serial: self.serial.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// 16-bit component of a framebuffer pixel, for tests and logging.
    pub fn framebuffer_pixel(&self, index: usize) -> Option<[u16; 3]> {
        self.back.get(index).copied()
    }

    pub fn set_pixel(&mut self, index: usize, rgb: [u8; 3]) {
        let Some(slot) = self.back.get_mut(index) else {
            return;
        };
        *slot = [expand(rgb[0]), expand(rgb[1]), expand(rgb[2])];
        self.back_dirty = true;
    }

    pub fn set_color_correction(&mut self, correction: &ColorCorrection) {
        // Re-latching the current correction must not cost an upload.
        if self.color == *correction && self.lut == LutState::Current {
            return;
        }
        self.color = *correction;
        self.lut = LutState::NeedsUpload;
    }

    pub fn set_firmware_config(&mut self, flags: u8) {
        if self.firmware_flags == flags && !self.flags_pending {
            return;
        }
        self.firmware_flags = flags;
        self.flags_pending = true;
    }

    /// Submit whatever the per-stream in-flight discipline allows right
    /// now: at most one control transfer (LUT upload or config packet)
    /// and one pixel frame.
    pub fn flush(&mut self) -> DeviceHealth {
        if self.control_in_flight.is_none() {
            if self.lut == LutState::NeedsUpload {
                let token = self.take_token();
                match self.submit(OUT_ENDPOINT, self.packed_lut(), token) {
                    Ok(()) => {
                        debug!("{}: LUT upload submitted", self.key);
                        self.lut = LutState::Uploading;
                        self.control_in_flight = Some((token, ControlTransfer::Lut));
                    }
                    Err(health) => return health,
                }
            } else if self.flags_pending {
                let token = self.take_token();
                match self.submit(OUT_ENDPOINT, self.config_packet(), token) {
                    Ok(()) => {
                        self.flags_pending = false;
                        self.control_in_flight = Some((token, ControlTransfer::Config));
                    }
                    Err(health) => return health,
                }
            }
        }

        // Pixel frames wait for the first LUT upload; anything the
        // firmware rendered before that would bypass color correction.
        if self.configured && self.back_dirty && self.frame_in_flight.is_none() {
            std::mem::swap(&mut self.front, &mut self.back);
            self.back_dirty = false;

            let token = self.take_token();
            match self.submit(OUT_ENDPOINT, self.packed_frame(), token) {
                Ok(()) => {
                    trace!("{}: frame submitted", self.key);
                    self.frame_in_flight = Some(token);
                }
                Err(health) => {
                    // Put the frame back so a later flush retries it.
                    std::mem::swap(&mut self.front, &mut self.back);
                    self.back_dirty = true;
                    return health;
                }
            }
        }

        DeviceHealth::Alive
    }

    pub fn on_transfer_complete(&mut self, token: TransferToken, status: TransferStatus) -> DeviceHealth {
        match status {
            TransferStatus::Ok => {
                if self.frame_in_flight == Some(token) {
                    self.frame_in_flight = None;
                } else if self.control_in_flight.map(|(t, _)| t) == Some(token) {
                    let (_, kind) = self.control_in_flight.take().unwrap();
                    if kind == ControlTransfer::Lut {
                        // A correction latched mid-upload leaves the
                        // state at NeedsUpload for the next round.
                        if self.lut == LutState::Uploading {
                            self.lut = LutState::Current;
                        }
                        if !self.configured {
                            debug!("{}: color LUT active", self.key);
                            self.configured = true;
                        }
                    }
                }
                // Completion is what drains queued work: a dirty back
                // buffer or a re-latched LUT goes out now.
                self.flush()
            }
            TransferStatus::Cancelled => {
                // Teardown in progress; drop our claim and do nothing.
                self.frame_in_flight = None;
                self.control_in_flight = None;
                DeviceHealth::Alive
            }
            TransferStatus::Stall | TransferStatus::IoError => {
                warn!("{}: transfer failed ({:?})", self.key, status);
                DeviceHealth::Failed
            }
        }
    }

    fn take_token(&mut self) -> TransferToken {
        self.next_token += 1;
        TransferToken(self.next_token)
    }

    fn submit(&mut self, endpoint: u8, data: Vec<u8>, token: TransferToken) -> Result<(), DeviceHealth> {
        match self.port.submit(UsbCommand::SubmitOut {
            key: self.key,
            endpoint,
            data,
            token,
        }) {
            Ok(()) => {
                self.submit_failures = 0;
                Ok(())
            }
            Err(common::Error::ChannelFull) => {
                self.submit_failures += 1;
                if self.submit_failures >= MAX_SUBMIT_FAILURES {
                    warn!("{}: submission retry budget exhausted", self.key);
                    Err(DeviceHealth::Failed)
                } else {
                    Err(DeviceHealth::Alive)
                }
            }
            Err(_) => Err(DeviceHealth::Failed),
        }
    }

    /// Pack the front buffer into a framebuffer packet sequence. The
    /// wire carries the high byte of each 16-bit component; the firmware
    /// re-expands and dithers.
    fn packed_frame(&self) -> Vec<u8> {
        let mut out = vec![0u8; FRAME_PACKETS * PACKET_SIZE];
        for (index, packet) in out.chunks_exact_mut(PACKET_SIZE).enumerate() {
            packet[0] = control_byte(TYPE_FRAMEBUFFER, index, FRAME_PACKETS);
            let base = index * PIXELS_PER_PACKET;
            for p in 0..PIXELS_PER_PACKET {
                let Some(px) = self.front.get(base + p) else {
                    break;
                };
                let at = 1 + p * 3;
                packet[at] = (px[0] >> 8) as u8;
                packet[at + 1] = (px[1] >> 8) as u8;
                packet[at + 2] = (px[2] >> 8) as u8;
            }
        }
        out
    }

    /// Build and pack the 257-entry-per-channel gamma/whitepoint table.
    fn packed_lut(&self) -> Vec<u8> {
        let mut entries = Vec::with_capacity(LUT_TOTAL_ENTRIES);
        for channel in 0..3 {
            let scale = self.color.whitepoint[channel];
            for i in 0..LUT_CHANNEL_ENTRIES {
                let input = i as f64 / 256.0;
                let output = input.powf(self.color.gamma) * scale * 65535.0;
                entries.push(output.round().clamp(0.0, 65535.0) as u16);
            }
        }

        let mut out = vec![0u8; LUT_PACKETS * PACKET_SIZE];
        for (index, packet) in out.chunks_exact_mut(PACKET_SIZE).enumerate() {
            packet[0] = control_byte(TYPE_LUT, index, LUT_PACKETS);
            // packet[1] reserved
            let base = index * LUT_ENTRIES_PER_PACKET;
            for e in 0..LUT_ENTRIES_PER_PACKET {
                let Some(&entry) = entries.get(base + e) else {
                    break;
                };
                let at = 2 + e * 2;
                packet[at..at + 2].copy_from_slice(&entry.to_le_bytes());
            }
        }
        out
    }

    fn config_packet(&self) -> Vec<u8> {
        let mut packet = vec![0u8; PACKET_SIZE];
        packet[0] = TYPE_CONFIG;
        packet[1] = self.firmware_flags;
        packet
    }
}

fn control_byte(packet_type: u8, index: usize, total: usize) -> u8 {
    let mut control = packet_type | (index as u8 & 0x1F);
    if index + 1 == total {
        control |= FINAL_BIT;
    }
    control
}

/// Expand an 8-bit component to 16 bits (0xAB -> 0xABAB), matching the
/// firmware's own expansion so host and device agree on full white.
fn expand(v: u8) -> u16 {
    u16::from(v) << 8 | u16::from(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{create_usb_bridge, UsbWorker};

    fn attach_device() -> (FcDevice, UsbWorker) {
        let (bridge, worker) = create_usb_bridge();
        let info = DeviceInfo {
            key: DeviceKey { bus: 2, address: 7 },
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            serial: Some("FCTEST01".into()),
        };
        (FcDevice::attach(&info, bridge.out_port()), worker)
    }

    fn next_out(worker: &UsbWorker) -> (Vec<u8>, TransferToken) {
        match worker.try_recv_command() {
            Some(UsbCommand::SubmitOut { data, token, .. }) => (data, token),
            other => panic!("expected SubmitOut, got {:?}", other),
        }
    }

    /// Drive the device until its LUT is active, returning the LUT bytes.
    fn configure(dev: &mut FcDevice, worker: &UsbWorker) -> Vec<u8> {
        dev.flush();
        let (lut, token) = next_out(worker);
        dev.on_transfer_complete(token, TransferStatus::Ok);
        assert!(dev.is_configured());
        lut
    }

    #[test]
    fn expansion_matches_firmware() {
        assert_eq!(expand(0x00), 0x0000);
        assert_eq!(expand(0x80), 0x8080);
        assert_eq!(expand(0xFF), 0xFFFF);
    }

    #[test]
    fn lut_upload_precedes_first_frame() {
        let (mut dev, worker) = attach_device();

        dev.set_pixel(0, [255, 128, 0]);
        dev.flush();

        // First submission must be the LUT, and no frame may follow
        // until its completion is observed.
        let (lut, lut_token) = next_out(&worker);
        assert_eq!(lut.len(), LUT_PACKETS * PACKET_SIZE);
        assert_eq!(lut[0] & 0xC0, TYPE_LUT);
        assert!(worker.try_recv_command().is_none());

        dev.on_transfer_complete(lut_token, TransferStatus::Ok);
        let (frame, _) = next_out(&worker);
        assert_eq!(frame.len(), FRAME_PACKETS * PACKET_SIZE);
        assert_eq!(frame[0] & 0xC0, TYPE_FRAMEBUFFER);
    }

    #[test]
    fn frame_packet_layout() {
        let (mut dev, worker) = attach_device();
        configure(&mut dev, &worker);

        // Pixel 0 in packet 0 and pixel 21 leading packet 1.
        dev.set_pixel(0, [0xFF, 0x80, 0x00]);
        dev.set_pixel(21, [0x01, 0x02, 0x03]);
        dev.flush();
        let (frame, _) = next_out(&worker);

        assert_eq!(frame[0], TYPE_FRAMEBUFFER); // index 0, not final
        assert_eq!(&frame[1..4], &[0xFF, 0x80, 0x00]);

        let second = &frame[PACKET_SIZE..2 * PACKET_SIZE];
        assert_eq!(second[0], TYPE_FRAMEBUFFER | 0x01);
        assert_eq!(&second[1..4], &[0x01, 0x02, 0x03]);

        // Final packet carries the final bit and index 24.
        let last = &frame[(FRAME_PACKETS - 1) * PACKET_SIZE..];
        assert_eq!(last[0], TYPE_FRAMEBUFFER | FINAL_BIT | 24);
    }

    #[test]
    fn framebuffer_expands_to_16_bit() {
        let (mut dev, _worker) = attach_device();
        dev.set_pixel(0, [0xFF, 0x80, 0x00]);
        assert_eq!(dev.framebuffer_pixel(0), Some([0xFFFF, 0x8080, 0x0000]));
    }

    #[test]
    fn identity_lut_is_linear() {
        let (mut dev, worker) = attach_device();
        let lut = configure(&mut dev, &worker);

        // Entry i of the red channel sits at packet i/31, slot i%31.
        let entry = |i: usize| {
            let at = (i / LUT_ENTRIES_PER_PACKET) * PACKET_SIZE + 2 + (i % LUT_ENTRIES_PER_PACKET) * 2;
            u16::from_le_bytes([lut[at], lut[at + 1]])
        };

        assert_eq!(entry(0), 0);
        assert_eq!(entry(256), 65535);
        // Identity correction: entry i = i/256 * 65535, within rounding.
        let mid = entry(128);
        assert!((i32::from(mid) - 32768).abs() <= 1, "mid entry {}", mid);
    }

    #[test]
    fn gamma_and_whitepoint_shape_the_lut() {
        let (mut dev, worker) = attach_device();
        dev.set_color_correction(&ColorCorrection {
            gamma: 2.0,
            whitepoint: [1.0, 0.5, 1.0],
        });
        let lut = configure(&mut dev, &worker);

        let entry = |i: usize| {
            let at = (i / LUT_ENTRIES_PER_PACKET) * PACKET_SIZE + 2 + (i % LUT_ENTRIES_PER_PACKET) * 2;
            u16::from_le_bytes([lut[at], lut[at + 1]])
        };

        // Red: (0.5)^2 * 65535 at the midpoint.
        assert_eq!(entry(128), (0.25 * 65535.0_f64).round() as u16);
        // Green channel scaled to half white.
        assert_eq!(entry(LUT_CHANNEL_ENTRIES + 256), (0.5 * 65535.0_f64).round() as u16);
    }

    #[test]
    fn backpressure_drops_intermediate_frames() {
        let (mut dev, worker) = attach_device();
        configure(&mut dev, &worker);

        dev.set_pixel(0, [1, 1, 1]);
        dev.flush();
        let (_, first) = next_out(&worker);

        // A burst of frames while one is in flight: only the back
        // buffer's latest contents survive.
        for v in 2..=100u8 {
            dev.set_pixel(0, [v, v, v]);
            dev.flush();
        }
        assert!(worker.try_recv_command().is_none());

        dev.on_transfer_complete(first, TransferStatus::Ok);
        let (frame, second) = next_out(&worker);
        assert_eq!(&frame[1..4], &[100, 100, 100]);

        // Nothing else was queued behind it.
        dev.on_transfer_complete(second, TransferStatus::Ok);
        assert!(worker.try_recv_command().is_none());
    }

    #[test]
    fn config_packet_follows_flags() {
        let (mut dev, worker) = attach_device();
        configure(&mut dev, &worker);

        dev.set_firmware_config(flags::NO_DITHERING | flags::MANUAL_LED | flags::LED_ON);
        dev.flush();
        let (packet, _) = next_out(&worker);
        assert_eq!(packet.len(), PACKET_SIZE);
        assert_eq!(packet[0], TYPE_CONFIG);
        assert_eq!(packet[1], 0x0D);
    }

    #[test]
    fn stall_fails_the_device() {
        let (mut dev, worker) = attach_device();
        dev.flush();
        let (_, token) = next_out(&worker);
        assert_eq!(
            dev.on_transfer_complete(token, TransferStatus::Stall),
            DeviceHealth::Failed
        );
    }

    #[test]
    fn cancelled_completion_is_quiet() {
        let (mut dev, worker) = attach_device();
        dev.set_pixel(0, [9, 9, 9]);
        dev.flush();
        let (_, token) = next_out(&worker);

        assert_eq!(
            dev.on_transfer_complete(token, TransferStatus::Cancelled),
            DeviceHealth::Alive
        );
        // No resubmission after a cancellation.
        assert!(worker.try_recv_command().is_none());
    }

    #[test]
    fn out_of_range_pixels_dropped() {
        let (mut dev, _worker) = attach_device();
        dev.set_pixel(NUM_PIXELS, [255, 255, 255]);
        dev.set_pixel(usize::MAX, [255, 255, 255]);
        assert!(!dev.back_dirty);
    }
}
