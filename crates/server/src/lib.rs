//! pixelbridge server
//!
//! Accepts Open Pixel Control streams over TCP and fans the pixel data
//! out to attached USB devices: Fadecandy LED controllers and Enttec
//! DMX adapters. The binary lives in `main.rs`; this library exposes
//! the building blocks so integration tests can drive the core without
//! hardware.

pub mod config;
pub mod core;
pub mod devices;
pub mod mapping;
pub mod network;
pub mod usb;
