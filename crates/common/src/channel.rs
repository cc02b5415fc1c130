//! Async channel bridge between the Tokio runtime and the USB thread
//!
//! The USB side of pixelbridge is blocking (libusb), so it lives on its
//! own OS thread. The server core talks to it through a bounded command
//! channel and receives hotplug and completion events back on a second
//! bounded channel. All driver callbacks therefore run on the core task,
//! never on the USB thread.

use async_channel::{bounded, Receiver, Sender, TrySendError};
use std::fmt;

/// Identity of a USB device: its (bus, address) tuple. Stable for the
/// lifetime of one attachment; reused addresses after replug produce a
/// fresh arrival event first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus {} addr {}", self.bus, self.address)
    }
}

/// Descriptor data captured when a device is opened on the USB thread.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub key: DeviceKey,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
}

/// Driver-assigned tag carried through a submission and back in its
/// completion event. The transport layer never interprets it; drivers
/// use it to locate their own per-transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferToken(pub u64);

/// Outcome of a submitted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transferred successfully.
    Ok,
    /// The endpoint stalled.
    Stall,
    /// Cancelled before execution (device gone or shutting down).
    Cancelled,
    /// A hard I/O failure; a synthetic leave event follows.
    IoError,
}

/// Commands from the server core to the USB thread.
#[derive(Debug)]
pub enum UsbCommand {
    /// Queue a bulk OUT transfer. The buffer moves into the command and
    /// stays untouched until the completion event is reported.
    SubmitOut {
        key: DeviceKey,
        endpoint: u8,
        data: Vec<u8>,
        token: TransferToken,
    },

    /// Queue a control OUT transfer with no data stage (device setup).
    SubmitControl {
        key: DeviceKey,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        token: TransferToken,
    },

    /// Release and close a device handle after driver teardown.
    CloseDevice { key: DeviceKey },

    /// Shutdown the USB thread gracefully.
    Shutdown,
}

/// Events from the USB thread to the server core.
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// Device opened and claimed; fired for devices present at startup
    /// (as synthetic arrivals) and for live hotplug arrivals.
    DeviceArrived { device: DeviceInfo },

    /// Device removed, either by hotplug or synthetically after an I/O
    /// error on its handle.
    DeviceLeft { key: DeviceKey },

    /// A submitted transfer finished.
    TransferComplete {
        key: DeviceKey,
        token: TransferToken,
        status: TransferStatus,
        bytes: usize,
    },
}

/// Handle for the Tokio runtime (async side).
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread.
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread.
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Submission handle for device drivers.
    pub fn out_port(&self) -> OutPort {
        OutPort {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

/// Non-blocking submission handle held by device drivers.
///
/// Drivers run inside event-loop callbacks and must not wait; a full
/// queue surfaces as [`Error::ChannelFull`](crate::Error::ChannelFull)
/// and the driver retries on a later flush.
#[derive(Debug, Clone)]
pub struct OutPort {
    cmd_tx: Sender<UsbCommand>,
}

impl OutPort {
    pub fn submit(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => crate::Error::ChannelFull,
            TrySendError::Closed(_) => crate::Error::Channel("USB thread gone".into()),
        })
    }
}

/// Handle for the USB thread (blocking side).
pub struct UsbWorker {
    cmd_rx: Receiver<UsbCommand>,
    event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Try to receive a command without blocking.
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to the Tokio runtime (blocking).
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Clone of the event sender, for the hotplug registry.
    pub fn event_sender(&self) -> Sender<UsbEvent> {
        self.event_tx.clone()
    }
}

/// Create the channel bridge between Tokio and the USB thread.
///
/// Returns (UsbBridge for Tokio, UsbWorker for the USB thread).
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}
