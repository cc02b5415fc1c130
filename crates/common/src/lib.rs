//! Common utilities for pixelbridge
//!
//! Shared functionality between the protocol, server core and USB layers:
//! error handling, logging setup, and the async channel bridge that
//! connects the Tokio runtime to the dedicated USB thread.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{
    create_usb_bridge, DeviceInfo, DeviceKey, OutPort, TransferStatus, TransferToken, UsbBridge,
    UsbCommand, UsbEvent, UsbWorker,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
