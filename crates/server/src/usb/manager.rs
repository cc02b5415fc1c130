//! USB device manager
//!
//! Runs on the USB thread. Tracks supported devices by their (bus,
//! address) tuple, replays the initial enumeration as synthetic arrival
//! events so upper layers have a single attach path, and debounces
//! hotplug callbacks to ride out rapid replug cycles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{DeviceInfo, DeviceKey, UsbEvent};
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use tracing::{debug, info, warn};

use crate::devices::{enttec, fadecandy};

/// Debounce window for hotplug events.
const HOTPLUG_DEBOUNCE: Duration = Duration::from_millis(500);

/// Vendor/product pairs a driver exists for; everything else on the bus
/// is ignored.
const SUPPORTED: &[(u16, u16)] = &[
    (fadecandy::VENDOR_ID, fadecandy::PRODUCT_ID),
    (enttec::VENDOR_ID, enttec::PRODUCT_ID),
];

#[derive(Debug, Clone, Copy)]
enum PendingHotplug {
    Arrived,
    Left,
}

#[derive(Debug, Clone, Copy)]
struct DebouncedEvent {
    event: PendingHotplug,
    fire_at: Instant,
}

/// Shared between the hotplug callback and the manager's poll loop.
type DebounceState = Arc<Mutex<HashMap<DeviceKey, DebouncedEvent>>>;

/// An opened, claimed device handle.
struct OpenDevice {
    handle: DeviceHandle<Context>,
    kernel_driver_detached: bool,
}

pub struct DeviceManager {
    context: Context,
    devices: HashMap<DeviceKey, OpenDevice>,
    _hotplug_registration: Option<Registration<Context>>,
    event_tx: async_channel::Sender<UsbEvent>,
    debounce: DebounceState,
}

impl DeviceManager {
    pub fn new(event_tx: async_channel::Sender<UsbEvent>) -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
            devices: HashMap::new(),
            _hotplug_registration: None,
            event_tx,
            debounce: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Enumerate present devices (announced as synthetic arrivals) and
    /// register for hotplug callbacks. Call once after construction.
    pub fn initialize(&mut self) -> Result<(), rusb::Error> {
        for device in self.context.devices()?.iter() {
            self.add_device(device);
        }

        let registration = HotplugBuilder::new()
            .enumerate(false) // already enumerated above
            .register(
                &self.context,
                Box::new(HotplugCallback {
                    debounce: Arc::clone(&self.debounce),
                }),
            )?;
        self._hotplug_registration = Some(registration);

        info!("USB manager initialized, {} device(s) attached", self.devices.len());
        Ok(())
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Handle for transfer execution, None once the device is gone.
    pub fn handle_mut(&mut self, key: DeviceKey) -> Option<&mut DeviceHandle<Context>> {
        self.devices.get_mut(&key).map(|d| &mut d.handle)
    }

    /// Release a device at the core's request (driver teardown).
    pub fn close_device(&mut self, key: DeviceKey) {
        if let Some(open) = self.devices.remove(&key) {
            release(open);
            debug!("closed device at {}", key);
        }
    }

    /// Drop a device after a hard I/O failure and emit the synthetic
    /// leave event the transport contract promises.
    pub fn drop_failed_device(&mut self, key: DeviceKey) {
        if let Some(open) = self.devices.remove(&key) {
            release(open);
            warn!("device at {} dropped after I/O failure", key);
            let _ = self.event_tx.send_blocking(UsbEvent::DeviceLeft { key });
        }
    }

    /// Fire debounced hotplug events whose window has elapsed. Returns
    /// the number processed.
    pub fn process_debounced_events(&mut self) -> usize {
        let now = Instant::now();
        let ready: Vec<(DeviceKey, DebouncedEvent)> = {
            let mut state = self.debounce.lock().unwrap();
            let keys: Vec<DeviceKey> = state
                .iter()
                .filter(|(_, ev)| now >= ev.fire_at)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| state.remove(&k).map(|ev| (k, ev)))
                .collect()
        };

        let count = ready.len();
        for (key, ev) in ready {
            match ev.event {
                PendingHotplug::Arrived => self.handle_arrived(key),
                PendingHotplug::Left => self.handle_left(key),
            }
        }
        count
    }

    fn handle_arrived(&mut self, key: DeviceKey) {
        let devices = match self.context.devices() {
            Ok(d) => d,
            Err(e) => {
                warn!("enumeration failed for arrival at {}: {}", key, e);
                return;
            }
        };

        for device in devices.iter() {
            if device.bus_number() == key.bus && device.address() == key.address {
                self.add_device(device);
                return;
            }
        }
        debug!("arrival at {} no longer present", key);
    }

    fn handle_left(&mut self, key: DeviceKey) {
        if let Some(open) = self.devices.remove(&key) {
            // The hardware is gone; just drop the handle.
            drop(open);
            info!("device left at {}", key);
            let _ = self.event_tx.send_blocking(UsbEvent::DeviceLeft { key });
        }
    }

    /// Open, claim and announce a device if a driver exists for it.
    fn add_device(&mut self, device: Device<Context>) {
        let key = DeviceKey {
            bus: device.bus_number(),
            address: device.address(),
        };

        if self.devices.contains_key(&key) {
            return;
        }

        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                debug!("descriptor read failed at {}: {}", key, e);
                return;
            }
        };

        let vendor_id = descriptor.vendor_id();
        let product_id = descriptor.product_id();
        if !SUPPORTED.contains(&(vendor_id, product_id)) {
            return;
        }

        let handle = match device.open() {
            Ok(h) => h,
            Err(e) => {
                warn!(
                    "cannot open {:04x}:{:04x} at {}: {}",
                    vendor_id, product_id, key, e
                );
                return;
            }
        };

        // FTDI widgets usually arrive bound to the kernel serial driver.
        let kernel_driver_detached = match handle.kernel_driver_active(0) {
            Ok(true) => match handle.detach_kernel_driver(0) {
                Ok(()) => true,
                Err(e) => {
                    warn!("kernel driver detach failed at {}: {}", key, e);
                    false
                }
            },
            _ => false,
        };

        if let Err(e) = handle.claim_interface(0) {
            warn!("cannot claim interface 0 at {}: {}", key, e);
            return;
        }

        let serial = descriptor
            .serial_number_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

        let info = DeviceInfo {
            key,
            vendor_id,
            product_id,
            serial,
        };

        info!(
            "USB device attached: {:04x}:{:04x} serial {:?} at {}",
            vendor_id, product_id, info.serial, key
        );

        self.devices.insert(
            key,
            OpenDevice {
                handle,
                kernel_driver_detached,
            },
        );
        let _ = self
            .event_tx
            .send_blocking(UsbEvent::DeviceArrived { device: info });
    }
}

/// Release a handle cleanly: unclaim and hand the device back to the
/// kernel driver it came from.
fn release(open: OpenDevice) {
    let OpenDevice {
        handle,
        kernel_driver_detached,
    } = open;
    let _ = handle.release_interface(0);
    if kernel_driver_detached {
        let _ = handle.attach_kernel_driver(0);
    }
}

/// Hotplug callback: records debounced events for the manager's poll
/// loop. Rapid plug/unplug cycles collapse to the final state.
struct HotplugCallback {
    debounce: DebounceState,
}

impl HotplugCallback {
    fn schedule(&self, device_key: DeviceKey, event: PendingHotplug) {
        let mut state = self.debounce.lock().unwrap();
        state.insert(
            device_key,
            DebouncedEvent {
                event,
                fire_at: Instant::now() + HOTPLUG_DEBOUNCE,
            },
        );
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        let key = DeviceKey {
            bus: device.bus_number(),
            address: device.address(),
        };
        debug!("hotplug: arrived at {}", key);
        self.schedule(key, PendingHotplug::Arrived);
    }

    fn device_left(&mut self, device: Device<T>) {
        let key = DeviceKey {
            bus: device.bus_number(),
            address: device.address(),
        };
        debug!("hotplug: left at {}", key);
        self.schedule(key, PendingHotplug::Left);
    }
}
