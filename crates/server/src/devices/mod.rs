//! Device drivers
//!
//! Two drivers share one capability set: the Fadecandy LED controller
//! (firmware-resident color pipeline, double-buffered frames) and the
//! Enttec DMX adapter (24-channel universe, latest-state coalescing).
//! Drivers are tagged variants chosen by a static matcher; their state
//! machines run on the core task and all I/O goes through the USB
//! thread's submission queue.

pub mod enttec;
pub mod fadecandy;

pub use enttec::EnttecDevice;
pub use fadecandy::FcDevice;

use std::fmt;

use common::{DeviceInfo, DeviceKey, OutPort, TransferStatus, TransferToken};
use protocol::ColorCorrection;

/// Whether a device survived the event that was just delivered to it.
/// `Failed` tells the core to tear the device down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    Alive,
    Failed,
}

/// Identification for logs and mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub kind: &'static str,
    pub serial: String,
}

impl fmt::Display for DeviceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (serial {})", self.kind, self.serial)
    }
}

/// A live, attached output device.
#[derive(Debug)]
pub enum Device {
    Fadecandy(FcDevice),
    Enttec(EnttecDevice),
}

impl Device {
    /// Consult the drivers in order (Fadecandy first, Enttec second) and
    /// attach the first that accepts the device. Returns None for
    /// hardware no driver claims.
    pub fn attach(info: &DeviceInfo, port: OutPort) -> Option<Device> {
        if FcDevice::matches(info.vendor_id, info.product_id) {
            return Some(Device::Fadecandy(FcDevice::attach(info, port)));
        }

        if EnttecDevice::matches(info.vendor_id, info.product_id) {
            // The FTDI vendor/product pair is shared by many serial
            // widgets; the Enttec adapter is identified by its serial
            // number prefix.
            let serial_ok = info
                .serial
                .as_deref()
                .is_some_and(|s| s.starts_with(enttec::SERIAL_PREFIX));
            if serial_ok {
                return Some(Device::Enttec(EnttecDevice::attach(info, port)));
            }
        }

        None
    }

    pub fn key(&self) -> DeviceKey {
        match self {
            Device::Fadecandy(d) => d.key(),
            Device::Enttec(d) => d.key(),
        }
    }

    pub fn describe(&self) -> DeviceDescription {
        match self {
            Device::Fadecandy(d) => d.describe(),
            Device::Enttec(d) => d.describe(),
        }
    }

    /// Number of addressable pixels on this device.
    pub fn pixel_count(&self) -> usize {
        match self {
            Device::Fadecandy(_) => fadecandy::NUM_PIXELS,
            Device::Enttec(_) => enttec::NUM_CHANNELS / 3,
        }
    }

    /// Write one mapped pixel into the device's pending state. Indexes
    /// past the device's capacity are dropped silently.
    pub fn set_pixel(&mut self, index: usize, rgb: [u8; 3]) {
        match self {
            Device::Fadecandy(d) => d.set_pixel(index, rgb),
            Device::Enttec(d) => d.set_pixel(index, rgb),
        }
    }

    /// Latch a new global color correction. The Fadecandy driver queues
    /// a firmware LUT upload; the Enttec driver rescales host-side.
    pub fn set_color_correction(&mut self, correction: &ColorCorrection) {
        match self {
            Device::Fadecandy(d) => d.set_color_correction(correction),
            Device::Enttec(d) => d.set_color_correction(correction),
        }
    }

    /// Latch firmware configuration flags. Only the Fadecandy firmware
    /// has any; other drivers ignore the request.
    pub fn set_firmware_config(&mut self, flags: u8) {
        if let Device::Fadecandy(d) = self {
            d.set_firmware_config(flags);
        }
    }

    /// Submit whatever pending state the in-flight discipline allows.
    pub fn flush(&mut self) -> DeviceHealth {
        match self {
            Device::Fadecandy(d) => d.flush(),
            Device::Enttec(d) => d.flush(),
        }
    }

    /// Deliver a transfer completion observed for this device.
    pub fn on_transfer_complete(&mut self, token: TransferToken, status: TransferStatus) -> DeviceHealth {
        match self {
            Device::Fadecandy(d) => d.on_transfer_complete(token, status),
            Device::Enttec(d) => d.on_transfer_complete(token, status),
        }
    }
}
