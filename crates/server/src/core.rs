//! Server core
//!
//! Owns the device table and the compiled mapping, and runs the single
//! dispatch loop that multiplexes network messages, USB events and the
//! reload signal. Every driver state machine runs here, on one task;
//! the ordering guarantees of the system reduce to this loop handling
//! one event at a time.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use common::{
    DeviceInfo, DeviceKey, TransferStatus, TransferToken, UsbBridge, UsbCommand, UsbEvent,
};
use protocol::{commands, parse_fadecandy_sysex, ColorCorrection, FadecandySysEx, OpcMessage};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::devices::{Device, DeviceHealth};
use crate::mapping::{apply_message, Mapping};

/// Events fed to the core by the network side.
#[derive(Debug)]
pub enum ServerEvent {
    Connected { conn: u64, peer: SocketAddr },
    Message { conn: u64, message: OpcMessage },
    Disconnected { conn: u64 },
}

struct DeviceEntry {
    device: Device,
    /// Index into the mapping's bindings, None when no binding selects
    /// this device (it stays attached but receives no pixel traffic).
    binding: Option<usize>,
}

pub struct ServerCore {
    devices: Vec<DeviceEntry>,
    mapping: Arc<Mapping>,
    global_color: Option<ColorCorrection>,
    listen_addr: String,
    usb: UsbBridge,
    config_path: Option<PathBuf>,
}

impl ServerCore {
    pub fn new(
        config: &Config,
        mapping: Mapping,
        usb: UsbBridge,
        config_path: Option<PathBuf>,
    ) -> Self {
        Self {
            devices: Vec::new(),
            mapping: Arc::new(mapping),
            global_color: config.color,
            listen_addr: config.listen_addr(),
            usb,
            config_path,
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Run until the network channel closes or the USB side goes away.
    pub async fn run(&mut self, mut net_rx: mpsc::Receiver<ServerEvent>) -> Result<()> {
        let usb = self.usb.clone();

        #[cfg(unix)]
        let mut hangup =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                .context("Failed to install SIGHUP handler")?;

        loop {
            #[cfg(unix)]
            let reload = hangup.recv();
            #[cfg(not(unix))]
            let reload = std::future::pending::<Option<()>>();

            tokio::select! {
                event = net_rx.recv() => match event {
                    Some(event) => self.handle_server_event(event),
                    None => {
                        info!("network event channel closed, stopping core");
                        break;
                    }
                },

                event = usb.recv_event() => match event {
                    Ok(event) => self.handle_usb_event(event),
                    Err(e) => {
                        error!("USB event channel failed: {}", e);
                        break;
                    }
                },

                _ = reload => {
                    info!("SIGHUP received, reloading configuration");
                    self.reload();
                }
            }
        }

        Ok(())
    }

    pub fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { conn, peer } => {
                debug!("client {} connected from {}", conn, peer);
            }
            ServerEvent::Message { message, .. } => self.dispatch(&message),
            ServerEvent::Disconnected { conn } => {
                debug!("client {} disconnected", conn);
            }
        }
    }

    pub fn handle_usb_event(&mut self, event: UsbEvent) {
        match event {
            UsbEvent::DeviceArrived { device } => self.attach_device(&device),
            UsbEvent::DeviceLeft { key } => self.detach_device(key, "left the bus"),
            UsbEvent::TransferComplete {
                key,
                token,
                status,
                ..
            } => self.handle_completion(key, token, status),
        }
    }

    /// Route one OPC message. Unknown commands are ignored by contract.
    pub fn dispatch(&mut self, message: &OpcMessage) {
        match message.command {
            commands::SET_PIXEL_COLORS => self.dispatch_pixels(message),
            commands::SYSTEM_EXCLUSIVE => self.dispatch_sysex(message),
            other => trace!("ignoring unknown OPC command {:#04x}", other),
        }
    }

    fn dispatch_pixels(&mut self, message: &OpcMessage) {
        let mapping = &self.mapping;
        let mut failed = Vec::new();

        for entry in &mut self.devices {
            let Some(index) = entry.binding else {
                continue;
            };
            if apply_message(mapping.binding(index), message, &mut entry.device)
                && entry.device.flush() == DeviceHealth::Failed
            {
                failed.push(entry.device.key());
            }
        }

        for key in failed {
            self.detach_device(key, "flush failure");
        }
    }

    fn dispatch_sysex(&mut self, message: &OpcMessage) {
        match parse_fadecandy_sysex(&message.data) {
            Ok(Some(FadecandySysEx::SetColorCorrection(correction))) => {
                debug!(
                    "global color correction: gamma {} whitepoint {:?}",
                    correction.gamma, correction.whitepoint
                );
                self.for_each_device(|device| device.set_color_correction(&correction));
            }
            Ok(Some(FadecandySysEx::SetFirmwareConfig(flags))) => {
                debug!("firmware configuration flags {:#04x}", flags);
                self.for_each_device(|device| device.set_firmware_config(flags));
            }
            Ok(None) => trace!("ignoring foreign system exclusive"),
            Err(e) => debug!("ignoring malformed system exclusive: {}", e),
        }
    }

    /// Apply a latched change to every device and flush, tearing down
    /// any device that reports failure.
    fn for_each_device(&mut self, mut apply: impl FnMut(&mut Device)) {
        let mut failed = Vec::new();
        for entry in &mut self.devices {
            apply(&mut entry.device);
            if entry.device.flush() == DeviceHealth::Failed {
                failed.push(entry.device.key());
            }
        }
        for key in failed {
            self.detach_device(key, "flush failure");
        }
    }

    fn attach_device(&mut self, info: &DeviceInfo) {
        // The table never holds two entries for one (bus, address); a
        // stale entry means we missed the leave event for its ancestor.
        if self.devices.iter().any(|e| e.device.key() == info.key) {
            self.detach_device(info.key, "replaced by new arrival");
        }

        let Some(mut device) = Device::attach(info, self.usb.out_port()) else {
            debug!(
                "no driver for {:04x}:{:04x} at {}",
                info.vendor_id, info.product_id, info.key
            );
            return;
        };

        let binding = self.mapping.bind(&device);
        if binding.is_none() {
            warn!("no mapping binds {}; it will receive no pixels", device.describe());
        }

        let color = self.mapping.effective_color(binding, self.global_color.as_ref());
        device.set_color_correction(&color);
        if let Some(options) = binding.and_then(|i| self.mapping.binding(i).firmware) {
            let flags = options.flags();
            if flags != 0 {
                device.set_firmware_config(flags);
            }
        }

        info!(
            "device attached: {} ({} pixels)",
            device.describe(),
            device.pixel_count()
        );
        if device.flush() == DeviceHealth::Failed {
            self.close_handle(device.key());
            return;
        }
        self.devices.push(DeviceEntry { device, binding });
    }

    fn detach_device(&mut self, key: DeviceKey, reason: &str) {
        let Some(position) = self.devices.iter().position(|e| e.device.key() == key) else {
            return;
        };
        let entry = self.devices.remove(position);
        info!("device detached ({}): {}", reason, entry.device.describe());
        self.close_handle(key);
    }

    /// Ask the USB thread to release the handle. Idempotent; a no-op
    /// for devices the transport already dropped.
    fn close_handle(&self, key: DeviceKey) {
        if let Err(e) = self.usb.out_port().submit(UsbCommand::CloseDevice { key }) {
            warn!("could not queue device close for {}: {}", key, e);
        }
    }

    fn handle_completion(&mut self, key: DeviceKey, token: TransferToken, status: TransferStatus) {
        let Some(entry) = self.devices.iter_mut().find(|e| e.device.key() == key) else {
            // Completions can trail a teardown; they carry nothing to do.
            trace!("completion for unknown device at {}", key);
            return;
        };

        if entry.device.on_transfer_complete(token, status) == DeviceHealth::Failed {
            self.detach_device(key, "transfer failure");
        }
    }

    /// Reload the configuration file and swap the mapping. Keeps the
    /// previous configuration when the new one fails to load.
    pub fn reload(&mut self) {
        let Some(path) = self.config_path.clone() else {
            info!("running on built-in defaults, nothing to reload");
            return;
        };
        match Config::load(&path) {
            Ok(config) => self.apply_config(&config),
            Err(e) => error!("configuration reload failed, keeping previous: {:#}", e),
        }
    }

    /// Install a new configuration: swap the mapping and re-bind every
    /// live device. Runs between dispatches, so no message ever sees a
    /// half-updated table.
    pub fn apply_config(&mut self, config: &Config) {
        if config.listen_addr() != self.listen_addr {
            warn!(
                "listen address changed ({} -> {}); restart to apply",
                self.listen_addr,
                config.listen_addr()
            );
        }

        self.global_color = config.color;
        self.mapping = Arc::new(Mapping::compile(config));

        let mapping = Arc::clone(&self.mapping);
        let global = self.global_color;
        let mut failed = Vec::new();

        for entry in &mut self.devices {
            entry.binding = mapping.bind(&entry.device);
            let color = mapping.effective_color(entry.binding, global.as_ref());
            entry.device.set_color_correction(&color);
            if let Some(options) = entry.binding.and_then(|i| mapping.binding(i).firmware) {
                entry.device.set_firmware_config(options.flags());
            }
            if entry.device.flush() == DeviceHealth::Failed {
                failed.push(entry.device.key());
            }
        }
        for key in failed {
            self.detach_device(key, "flush failure");
        }

        info!(
            "configuration applied: {} binding(s), {} device(s) re-bound",
            self.mapping.len(),
            self.devices.len()
        );
    }
}
