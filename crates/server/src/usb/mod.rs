//! USB transport
//!
//! Everything that touches libusb lives here, on a dedicated thread:
//! enumeration, hotplug callbacks, and blocking transfer execution. The
//! rest of the server sees only the command/event channels defined in
//! `common::channel`.

pub mod manager;
pub mod worker;

pub use worker::spawn_usb_worker;
